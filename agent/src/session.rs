//! Copy-session lifecycle.
//!
//! State machine per SD hardware id: `(none) → active → {completed |
//! early_removed}`. The local store is authoritative: a session is created
//! and persisted before any remote call, progress mutations persist
//! immediately, and a restart restores every still-active session. Remote
//! promotion is opportunistic — the only remote failure a caller ever sees
//! is at session end, because the operator must know the session was not
//! recorded server-side.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::api::{SessionEndRequest, SessionProgressRequest, SessionStartRequest};
use crate::error::AgentError;
use crate::model::{CopySession, RemovalDecision, TrackedFile, Volume};
use crate::store::LocalStore;
use crate::sync::SyncGateway;

/// Owns the lifecycle of "a card is being copied" sessions.
pub struct CopySessionManager {
    store: Arc<Mutex<LocalStore>>,
    gateway: Arc<SyncGateway>,
    device_id: String,
    /// Active sessions keyed by SD hardware id
    active: Mutex<HashMap<String, CopySession>>,
}

impl CopySessionManager {
    /// Build the manager and restore active sessions from the store, so a
    /// session started before a crash picks up where it left off.
    pub fn new(
        store: Arc<Mutex<LocalStore>>,
        gateway: Arc<SyncGateway>,
        device_id: String,
    ) -> Self {
        let mut active = HashMap::new();
        for session in store.lock().active_sessions() {
            info!(
                session_id = %session.session_id,
                sd = %session.sd_label,
                "restored active session"
            );
            active.insert(session.sd_hardware_id.clone(), session);
        }

        CopySessionManager {
            store,
            gateway,
            device_id,
            active: Mutex::new(active),
        }
    }

    /// Start a session for an inserted card.
    ///
    /// Idempotent: if an active session already exists for this hardware id
    /// the same session is returned unchanged, so an agent restart mid-copy
    /// does not spawn duplicates or reset progress. The local session is
    /// created first and works fully offline; remote confirmation is
    /// attempted afterwards and only flips the `synced` flag.
    pub async fn start_session(
        &self,
        volume: &Volume,
        camera_number: Option<u32>,
    ) -> Result<CopySession, AgentError> {
        {
            let active = self.active.lock();
            if let Some(existing) = active.get(&volume.hardware_id) {
                return Ok(existing.clone());
            }
        }

        let session = CopySession::start(volume, camera_number);
        self.store.lock().put_session(&session)?;
        self.active
            .lock()
            .insert(volume.hardware_id.clone(), session.clone());
        info!(
            session_id = %session.session_id,
            sd = %session.sd_label,
            files = session.files_detected,
            "session started"
        );

        let request = SessionStartRequest {
            session_id: session.session_id,
            device_id: self.device_id.clone(),
            sd_hardware_id: session.sd_hardware_id.clone(),
            camera_number: session.camera_number,
            sd_label: session.sd_label.clone(),
            files_detected: session.files_detected,
            total_size_bytes: session.total_size_bytes,
            started_at: session.started_at,
        };
        match self.gateway.start_session(&request).await {
            Ok(()) => self.mark_synced(&volume.hardware_id),
            Err(e) => {
                warn!(session_id = %session.session_id, error = %e, "session start not confirmed remotely");
                Ok(session)
            }
        }
    }

    fn mark_synced(&self, hardware_id: &str) -> Result<CopySession, AgentError> {
        let updated = {
            let mut active = self.active.lock();
            match active.get_mut(hardware_id) {
                Some(session) => {
                    session.synced = true;
                    session.clone()
                }
                None => {
                    return Err(AgentError::SessionNotFound {
                        hardware_id: hardware_id.to_string(),
                    })
                }
            }
        };
        self.store.lock().put_session(&updated)?;
        Ok(updated)
    }

    /// Record one correlated file arrival for the card's session.
    /// Progress is monotonic; the remote progress update is best-effort.
    pub async fn record_file_copied(
        &self,
        hardware_id: &str,
        file: &TrackedFile,
    ) -> Result<CopySession, AgentError> {
        let session = {
            let mut active = self.active.lock();
            let session = active.get_mut(hardware_id).ok_or_else(|| {
                AgentError::SessionNotFound {
                    hardware_id: hardware_id.to_string(),
                }
            })?;
            session.record_copied();
            session.clone()
        };
        self.store.lock().put_session(&session)?;
        info!(
            session_id = %session.session_id,
            file = %file.name,
            copied = session.files_copied,
            pending = session.files_pending,
            "file copied"
        );

        let request = SessionProgressRequest {
            files_detected: session.files_detected,
            files_copied: session.files_copied,
            files_pending: session.files_pending,
        };
        if let Err(e) = self
            .gateway
            .update_progress(&session.session_id, &request)
            .await
        {
            warn!(session_id = %session.session_id, error = %e, "progress not recorded remotely");
        }
        Ok(session)
    }

    /// Update the detected totals after the card has been enumerated.
    pub fn update_detected(
        &self,
        hardware_id: &str,
        files_detected: u64,
        total_size_bytes: u64,
    ) -> Result<CopySession, AgentError> {
        let session = {
            let mut active = self.active.lock();
            let session = active.get_mut(hardware_id).ok_or_else(|| {
                AgentError::SessionNotFound {
                    hardware_id: hardware_id.to_string(),
                }
            })?;
            session.update_detected(files_detected, total_size_bytes);
            session.clone()
        };
        self.store.lock().put_session(&session)?;
        Ok(session)
    }

    /// End the session for a removed card. The decision records operator
    /// intent; the final status records the actual outcome — `completed`
    /// iff nothing was pending at end time, `early_removed` otherwise.
    ///
    /// The local transition always happens and is persisted before the
    /// remote call. An error from this method therefore means "ended
    /// locally, NOT recorded server-side"; the session itself is already
    /// terminal and cannot be restarted.
    pub async fn end_session(
        &self,
        hardware_id: &str,
        decision: RemovalDecision,
    ) -> Result<CopySession, AgentError> {
        let mut session = {
            let mut active = self.active.lock();
            active
                .remove(hardware_id)
                .ok_or_else(|| AgentError::SessionNotFound {
                    hardware_id: hardware_id.to_string(),
                })?
        };

        session.status = session.terminal_status();
        session.removal_decision = Some(decision);
        session.ended_at = Some(Utc::now());
        self.store.lock().put_session(&session)?;
        info!(
            session_id = %session.session_id,
            status = %session.status,
            decision = %decision,
            pending = session.files_pending,
            "session ended"
        );

        let request = SessionEndRequest {
            status: session.status,
            removal_decision: decision,
            files_pending: session.files_pending,
            ended_at: session.ended_at.unwrap_or_else(Utc::now),
        };
        self.gateway
            .end_session(&session.session_id, &request)
            .await?;
        session.synced = true;
        self.store.lock().put_session(&session)?;
        Ok(session)
    }

    /// Safe iff no active session exists for the card, or nothing is
    /// pending. Pure read; never mutates.
    pub fn can_safely_remove(&self, hardware_id: &str) -> bool {
        match self.active.lock().get(hardware_id) {
            Some(session) => session.files_pending == 0,
            None => true,
        }
    }

    pub fn active_session(&self, hardware_id: &str) -> Option<CopySession> {
        self.active.lock().get(hardware_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<CopySession> {
        self.active.lock().values().cloned().collect()
    }
}
