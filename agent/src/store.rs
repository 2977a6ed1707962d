//! Durable local state.
//!
//! A single JSON document on disk holds everything the agent must not lose
//! across restarts: copy sessions, backup-disk registrations, the cached
//! deletion tasks and the sync queue. Writes go through a temp file and an
//! atomic rename, so a crash mid-save leaves the previous state intact.
//!
//! Local state is the source of truth; remote confirmation is best-effort
//! and eventually consistent.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AgentError;
use crate::model::{BackupDiskRegistration, CopySession, DeletionTask, SyncQueueItem};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    sessions: HashMap<String, CopySession>,
    #[serde(default)]
    backup_disks: HashMap<String, BackupDiskRegistration>,
    #[serde(default)]
    pending_deletions: Vec<DeletionTask>,
    #[serde(default)]
    sync_queue: Vec<SyncQueueItem>,
    #[serde(default)]
    fallback_salt: Option<String>,
}

/// File-backed key-value store for agent state.
pub struct LocalStore {
    path: PathBuf,
    state: StoreState,
}

impl LocalStore {
    /// Open the store at `path`, creating empty state if the file does not
    /// exist. A corrupt state file is moved aside (`<path>.corrupt`) and
    /// replaced with empty state rather than refusing to start.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let path = path.into();

        let state = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state file corrupt, starting fresh");
                    let sidecar = path.with_extension("corrupt");
                    if let Err(e) = fs::rename(&path, &sidecar) {
                        warn!(error = %e, "could not preserve corrupt state file");
                    }
                    StoreState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(e) => {
                return Err(AgentError::Store {
                    path: path.clone(),
                    source: e,
                })
            }
        };

        Ok(LocalStore { path, state })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), AgentError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| AgentError::Store {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let contents =
            serde_json::to_string_pretty(&self.state).map_err(AgentError::StoreFormat)?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents).map_err(|e| AgentError::Store {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| AgentError::Store {
            path: self.path.clone(),
            source: e,
        })
    }

    // --- sessions -------------------------------------------------------

    /// Insert or update a session, keyed by its id.
    pub fn put_session(&mut self, session: &CopySession) -> Result<(), AgentError> {
        self.state
            .sessions
            .insert(session.session_id.to_string(), session.clone());
        self.persist()
    }

    pub fn session(&self, session_id: &Uuid) -> Option<CopySession> {
        self.state.sessions.get(&session_id.to_string()).cloned()
    }

    pub fn sessions(&self) -> Vec<CopySession> {
        self.state.sessions.values().cloned().collect()
    }

    /// Sessions to restore into the in-memory registry at startup.
    /// Only active sessions come back; terminal ones are history.
    pub fn active_sessions(&self) -> Vec<CopySession> {
        self.state
            .sessions
            .values()
            .filter(|s| s.is_active())
            .cloned()
            .collect()
    }

    // --- backup disks ---------------------------------------------------

    pub fn register_disk(&mut self, registration: &BackupDiskRegistration) -> Result<(), AgentError> {
        info!(disk_id = %registration.disk_id, name = %registration.name, "backup disk registered");
        self.state
            .backup_disks
            .insert(registration.disk_id.clone(), registration.clone());
        self.persist()
    }

    pub fn disk(&self, disk_id: &str) -> Option<BackupDiskRegistration> {
        self.state.backup_disks.get(disk_id).cloned()
    }

    pub fn is_registered_disk(&self, disk_id: &str) -> bool {
        self.state.backup_disks.contains_key(disk_id)
    }

    pub fn disks(&self) -> Vec<BackupDiskRegistration> {
        self.state.backup_disks.values().cloned().collect()
    }

    // --- deletion task cache --------------------------------------------

    pub fn pending_deletions(&self) -> Vec<DeletionTask> {
        self.state.pending_deletions.clone()
    }

    pub fn set_pending_deletions(&mut self, tasks: Vec<DeletionTask>) -> Result<(), AgentError> {
        self.state.pending_deletions = tasks;
        self.persist()
    }

    // --- sync queue -----------------------------------------------------

    pub fn push_queue_item(&mut self, item: SyncQueueItem) -> Result<(), AgentError> {
        self.state.sync_queue.push(item);
        self.persist()
    }

    /// Remove and return the whole queue for a replay pass.
    pub fn take_queue(&mut self) -> Result<Vec<SyncQueueItem>, AgentError> {
        let items = std::mem::take(&mut self.state.sync_queue);
        self.persist()?;
        Ok(items)
    }

    /// Put still-failing items back at the front of the queue, ahead of
    /// anything enqueued while the replay was running, preserving FIFO
    /// order overall.
    pub fn requeue_front(&mut self, items: Vec<SyncQueueItem>) -> Result<(), AgentError> {
        if items.is_empty() {
            return Ok(());
        }
        let newer = std::mem::take(&mut self.state.sync_queue);
        self.state.sync_queue = items;
        self.state.sync_queue.extend(newer);
        self.persist()
    }

    pub fn queue_len(&self) -> usize {
        self.state.sync_queue.len()
    }

    // --- identity salt --------------------------------------------------

    /// The persisted salt mixed into hardware-id fallback hashing, created
    /// on first use so derived ids stay stable across restarts.
    pub fn fallback_salt(&mut self) -> Result<String, AgentError> {
        if let Some(salt) = &self.state.fallback_salt {
            return Ok(salt.clone());
        }
        let salt = Uuid::new_v4().to_string();
        self.state.fallback_salt = Some(salt.clone());
        self.persist()?;
        Ok(salt)
    }
}
