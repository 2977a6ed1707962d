//! The agent runtime.
//!
//! One coordinator owns every service and drives the control flow:
//! volume events start and end sessions, watcher events update progress
//! and mirror media state through the gateway, and the periodic jobs
//! (health probe, heartbeat, deletion pass) run on their own tick.
//!
//! All periodic work is interval-driven with skipped (never queued) missed
//! ticks, and the whole loop stops cleanly through a cancellation token.
//! Filesystem-heavy work (scans, polls, card enumeration) runs on blocking
//! tasks so a slow checksum cannot stall volume detection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{HttpApi, MediaSyncRecord, RegisterAgentRequest, RemoteApi};
use crate::checksum::ChecksumEngine;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::{FileEvent, VolumeEvent};
use crate::model::{RemovalDecision, TrackedFile, Volume, VolumeKind};
use crate::session::CopySessionManager;
use crate::store::LocalStore;
use crate::sync::{retry_with_backoff, SyncGateway, SyncOutcome};
use crate::volume::{enumerate_copy_sources, VolumeDetector};
use crate::watcher::FileWatcher;

/// Owns and coordinates all agent services.
pub struct AgentRuntime {
    config: AgentConfig,
    engine: ChecksumEngine,
    detector: Arc<VolumeDetector>,
    watcher: Arc<FileWatcher>,
    sessions: Arc<CopySessionManager>,
    gateway: Arc<SyncGateway>,
    deletions: Arc<crate::deletion::DeletionTaskProcessor>,
    cancel: CancellationToken,
}

impl AgentRuntime {
    /// Build a runtime talking to the real HTTP backend.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let api = Arc::new(HttpApi::new(&config.api)?);
        Self::with_api(config, api)
    }

    /// Build a runtime over an injected API implementation (used by tests).
    pub fn with_api(config: AgentConfig, api: Arc<dyn RemoteApi>) -> Result<Self, AgentError> {
        let store = Arc::new(Mutex::new(LocalStore::open(&config.storage.state_path)?));
        let engine = ChecksumEngine::new(
            config.checksum.algorithm,
            config.checksum.full_hash_threshold_bytes,
        );

        let gateway = Arc::new(SyncGateway::new(api, Arc::clone(&store)));
        let detector = Arc::new(VolumeDetector::new(
            config.volumes.mount_roots.clone(),
            config.watcher.extensions.clone(),
            Arc::clone(&store),
        )?);
        let watcher = Arc::new(FileWatcher::new(
            config.watcher.folders.clone(),
            config.watcher.extensions.clone(),
            config.watcher.settle_polls,
            Duration::from_secs(config.watcher.registration_ttl_secs),
            engine,
        ));
        let sessions = Arc::new(CopySessionManager::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            config.device.device_id.clone(),
        ));
        let deletions = Arc::new(crate::deletion::DeletionTaskProcessor::new(
            Arc::clone(&gateway),
            Arc::clone(&store),
            config.device.device_id.clone(),
            config.deletion.media_dirs.clone(),
        ));

        Ok(AgentRuntime {
            config,
            engine,
            detector,
            watcher,
            sessions,
            gateway,
            deletions,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops the run loop; hand a clone to the signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn sessions(&self) -> &CopySessionManager {
        &self.sessions
    }

    pub fn gateway(&self) -> &SyncGateway {
        &self.gateway
    }

    /// Run until cancelled.
    pub async fn run(&self) -> Result<(), AgentError> {
        self.startup().await;

        let mut sd_tick = self.interval(self.config.volumes.sd_scan_interval_secs);
        let mut backup_tick = self.interval(self.config.volumes.backup_scan_interval_secs);
        let mut watch_tick = self.interval(self.config.watcher.poll_interval_secs);
        let mut health_tick = self.interval(self.config.sync.health_check_interval_secs);
        let mut heartbeat_tick = self.interval(self.config.sync.heartbeat_interval_secs);
        let mut deletion_tick = self.interval(self.config.deletion.interval_secs);

        info!("agent running");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                _ = sd_tick.tick() => self.scan_volumes(VolumeKind::Sd).await,
                _ = backup_tick.tick() => self.scan_volumes(VolumeKind::Backup).await,
                _ = watch_tick.tick() => self.poll_watcher().await,
                _ = health_tick.tick() => {
                    self.gateway.check_health().await;
                }
                _ = heartbeat_tick.tick() => {
                    if let Err(e) = self.gateway.heartbeat(&self.config.device.device_id).await {
                        debug!(error = %e, "heartbeat not delivered");
                    }
                }
                _ = deletion_tick.tick() => {
                    let pass = self.deletions.run_once().await;
                    debug!(attempted = pass.attempted, "deletion tick");
                }
            }
        }
        Ok(())
    }

    fn interval(&self, secs: u64) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Register with the backend. Registration failure leaves the agent
    /// running offline; an identity conflict is fatal to the run.
    async fn startup(&self) {
        let request = RegisterAgentRequest {
            device_id: self.config.device.device_id.clone(),
            hostname: hostname(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let attempts = self.config.sync.retry_attempts;
        let delay = Duration::from_millis(self.config.sync.retry_initial_delay_ms);
        match retry_with_backoff(attempts, delay, || self.gateway.register_agent(&request)).await {
            Ok(()) => info!(device_id = %request.device_id, "agent registered"),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "registration deferred, starting offline");
            }
            Err(e) => error!(error = %e, "agent registration rejected"),
        }

        // Remote-managed settings are advisory; the local file always wins.
        match self.gateway.fetch_agent_config(&request.device_id).await {
            Ok(remote) => debug!(%remote, "remote agent config received"),
            Err(e) => debug!(error = %e, "remote agent config unavailable"),
        }
    }

    async fn scan_volumes(&self, kind: VolumeKind) {
        let detector = Arc::clone(&self.detector);
        let events = match tokio::task::spawn_blocking(move || detector.scan(kind)).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "volume scan task failed");
                return;
            }
        };
        for event in events {
            self.handle_volume_event(event).await;
        }
    }

    async fn poll_watcher(&self) {
        let watcher = Arc::clone(&self.watcher);
        let events = match tokio::task::spawn_blocking(move || watcher.poll()).await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "watcher poll task failed");
                return;
            }
        };
        for event in events {
            self.handle_file_event(event).await;
        }
    }

    async fn handle_volume_event(&self, event: VolumeEvent) {
        match event {
            VolumeEvent::Inserted(volume) if volume.kind == VolumeKind::Sd => {
                self.on_card_inserted(volume).await;
            }
            VolumeEvent::Inserted(volume) => {
                info!(label = %volume.label, "backup disk available");
            }
            VolumeEvent::Removed(volume) if volume.kind == VolumeKind::Sd => {
                self.on_card_removed(volume).await;
            }
            VolumeEvent::Removed(volume) => {
                info!(label = %volume.label, "backup disk detached");
            }
        }
    }

    async fn on_card_inserted(&self, volume: Volume) {
        let camera_number = self.lookup_camera_number(&volume.hardware_id).await;
        if let Err(e) = self.sessions.start_session(&volume, camera_number).await {
            error!(label = %volume.label, error = %e, "could not start session");
            return;
        }

        // Enumerate the card so arrivals at the destination can be matched
        // back to it, and the session knows what "complete" means.
        let mount = volume.mount_path.clone();
        let hardware_id = volume.hardware_id.clone();
        let extensions = self.config.watcher.extensions.clone();
        let engine = self.engine;
        let enumerated = tokio::task::spawn_blocking(move || {
            enumerate_copy_sources(&mount, &hardware_id, &extensions, &engine)
        })
        .await;

        let (operations, file_count, total_size) = match enumerated {
            Ok(result) => result,
            Err(e) => {
                warn!(label = %volume.label, error = %e, "card enumeration task failed");
                return;
            }
        };
        self.watcher.register_copy_sources(operations);
        if let Err(e) =
            self.sessions
                .update_detected(&volume.hardware_id, file_count, total_size)
        {
            warn!(label = %volume.label, error = %e, "could not update detected totals");
        }
    }

    async fn on_card_removed(&self, volume: Volume) {
        if self.sessions.active_session(&volume.hardware_id).is_none() {
            return;
        }
        let decision = if self.sessions.can_safely_remove(&volume.hardware_id) {
            RemovalDecision::Safe
        } else {
            RemovalDecision::EarlyConfirmed
        };
        match self.sessions.end_session(&volume.hardware_id, decision).await {
            Ok(session) => {
                info!(label = %volume.label, status = %session.status, "session closed on removal");
            }
            Err(e) => {
                // Locally the session is already terminal; the operator
                // still needs to know the server has no record of it.
                error!(label = %volume.label, error = %e, "session ended locally but not recorded remotely");
            }
        }
    }

    async fn handle_file_event(&self, event: FileEvent) {
        match event {
            FileEvent::Copied {
                file,
                source_path,
                source_device,
            } => {
                debug!(file = %file.name, source = %source_path.display(), "copy correlated");
                match self.sessions.record_file_copied(&source_device, &file).await {
                    Ok(session) => self.mirror_media(&file, Some(session.session_id)).await,
                    Err(e) => {
                        warn!(file = %file.name, error = %e, "copied file has no session");
                        self.mirror_media(&file, None).await;
                    }
                }
            }
            FileEvent::Renamed {
                file,
                old_name,
                new_name,
            } => {
                info!(%old_name, %new_name, "file renamed");
                self.mirror_media(&file, None).await;
            }
            FileEvent::Added(file) => {
                debug!(file = %file.name, "unmatched file added");
            }
            FileEvent::Changed(file) => {
                debug!(file = %file.name, "file contents changed");
            }
            FileEvent::Removed { name, .. } => {
                debug!(file = %name, "file removed");
            }
        }
    }

    async fn mirror_media(&self, file: &TrackedFile, session_id: Option<uuid::Uuid>) {
        let record = MediaSyncRecord {
            device_id: self.config.device.device_id.clone(),
            session_id,
            file_name: file.name.clone(),
            folder: file.folder.display().to_string(),
            size: file.size,
            checksum: file.checksum.to_string(),
            modified_at: file.modified_at,
        };
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "cannot serialize media record");
                return;
            }
        };
        match self.gateway.sync_media(payload).await {
            Ok(SyncOutcome::Delivered) => {}
            Ok(SyncOutcome::Queued) => debug!(file = %file.name, "media sync queued"),
            Err(e) => warn!(file = %file.name, error = %e, "media sync rejected"),
        }
    }

    async fn lookup_camera_number(&self, hardware_id: &str) -> Option<u32> {
        match self
            .gateway
            .sd_card_bindings(&self.config.device.device_id)
            .await
        {
            Ok(bindings) => bindings
                .iter()
                .find(|b| b.hardware_id == hardware_id)
                .map(|b| b.camera_number),
            Err(e) => {
                debug!(error = %e, "card bindings unavailable");
                None
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockApi;
    use crate::api::SdCardBinding;
    use crate::config::{StorageConfig, VolumeConfig, WatchFolder, WatcherConfig};
    use crate::model::{SessionStatus, WatchFolderKind};
    use std::fs;
    use std::path::Path;

    struct Fixture {
        api: Arc<MockApi>,
        runtime: AgentRuntime,
        card_mount: std::path::PathBuf,
        ingest: std::path::PathBuf,
    }

    fn fixture(dir: &tempfile::TempDir) -> Fixture {
        let ingest = dir.path().join("ingest");
        fs::create_dir_all(&ingest).expect("Failed to create ingest");

        let config = AgentConfig {
            storage: StorageConfig {
                state_path: dir.path().join("state.json"),
            },
            volumes: VolumeConfig {
                mount_roots: vec![dir.path().join("mnt")],
                ..VolumeConfig::default()
            },
            watcher: WatcherConfig {
                folders: vec![WatchFolder {
                    path: ingest.clone(),
                    kind: WatchFolderKind::Ingest,
                    recursive: true,
                }],
                ..WatcherConfig::default()
            },
            ..AgentConfig::default()
        };

        let api = Arc::new(MockApi::default());
        let runtime = AgentRuntime::with_api(config, Arc::clone(&api) as Arc<dyn RemoteApi>)
            .expect("Failed to build runtime");
        Fixture {
            api,
            runtime,
            card_mount: dir.path().join("mnt/CARD_A"),
            ingest,
        }
    }

    fn write_clip(dir: &Path, name: &str, contents: &[u8]) {
        fs::create_dir_all(dir).expect("Failed to create dir");
        fs::write(dir.join(name), contents).expect("Failed to write clip");
    }

    #[tokio::test]
    async fn test_card_insertion_starts_session_and_registers_sources() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir);

        let dcim = f.card_mount.join("DCIM/100CANON");
        write_clip(&dcim, "C0001.mp4", b"clip one");
        write_clip(&dcim, "C0002.mp4", b"clip two!");

        f.runtime.scan_volumes(VolumeKind::Sd).await;

        let sessions = f.runtime.sessions().active_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].files_detected, 2);
        assert_eq!(sessions[0].files_copied, 0);
        assert_eq!(f.api.call_count("session.start"), 1);
    }

    #[tokio::test]
    async fn test_copy_correlation_updates_progress_and_mirrors_media() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir);

        let contents = b"the one and only clip";
        write_clip(&f.card_mount.join("DCIM/100CANON"), "C0001.mp4", contents);
        f.runtime.scan_volumes(VolumeKind::Sd).await;

        // The editor copies the clip into the ingest folder.
        write_clip(&f.ingest, "C0001.mp4", contents);
        f.runtime.poll_watcher().await; // settle poll 1
        f.runtime.poll_watcher().await; // settle poll 2 -> copied

        let session = f.runtime.sessions().active_sessions().remove(0);
        assert_eq!(session.files_copied, 1);
        assert_eq!(session.files_pending, 0);
        assert_eq!(f.api.synced_media.lock().len(), 1);
        let record = f.api.synced_media.lock()[0].clone();
        assert_eq!(record["file_name"], "C0001.mp4");
        assert_eq!(record["session_id"], session.session_id.to_string());
    }

    #[tokio::test]
    async fn test_card_removal_ends_session_by_pending_state() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir);

        write_clip(&f.card_mount.join("DCIM/100CANON"), "C0001.mp4", b"clip");
        f.runtime.scan_volumes(VolumeKind::Sd).await;
        let hardware_id = f.runtime.sessions().active_sessions()[0]
            .sd_hardware_id
            .clone();

        // Card yanked with the clip still pending.
        fs::remove_dir_all(&f.card_mount).expect("Failed to remove card");
        f.runtime.scan_volumes(VolumeKind::Sd).await;

        assert!(f.runtime.sessions().active_session(&hardware_id).is_none());
        let stored = {
            let store = LocalStore::open(dir.path().join("state.json")).expect("open store");
            store.sessions().remove(0)
        };
        assert_eq!(stored.status, SessionStatus::EarlyRemoved);
        assert_eq!(stored.removal_decision, Some(RemovalDecision::EarlyConfirmed));
        assert_eq!(f.api.call_count("session.end"), 1);
    }

    #[tokio::test]
    async fn test_camera_number_comes_from_bindings() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir);

        write_clip(&f.card_mount.join("DCIM/100CANON"), "C0001.mp4", b"clip");

        // Bind whatever hardware id the detector will derive for the card.
        let store = Arc::new(Mutex::new(
            LocalStore::open(dir.path().join("state.json")).expect("open store"),
        ));
        let detector = VolumeDetector::new(
            vec![dir.path().join("mnt")],
            vec!["mp4".to_string()],
            store,
        )
        .expect("detector");
        let hardware_id = detector.hardware_id(&f.card_mount);
        f.api.bindings.lock().push(SdCardBinding {
            device_id: "offload-agent".to_string(),
            hardware_id,
            camera_number: 4,
        });

        f.runtime.scan_volumes(VolumeKind::Sd).await;
        assert_eq!(
            f.runtime.sessions().active_sessions()[0].camera_number,
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_offline_insertion_still_tracks_locally() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir);
        f.api.set_network_down(true);

        let contents = b"offline clip";
        write_clip(&f.card_mount.join("DCIM/100CANON"), "C0001.mp4", contents);
        f.runtime.scan_volumes(VolumeKind::Sd).await;
        write_clip(&f.ingest, "C0001.mp4", contents);
        f.runtime.poll_watcher().await;
        f.runtime.poll_watcher().await;

        let session = f.runtime.sessions().active_sessions().remove(0);
        assert_eq!(session.files_copied, 1);
        assert!(!session.synced);
        // The media mirror went to the queue, not nowhere.
        assert_eq!(f.runtime.gateway().queue_len(), 1);
    }
}
