//! Remote sync gateway.
//!
//! Every remote call the agent makes goes through here. A network-level
//! failure (no HTTP response) flips the gateway offline; the designated
//! write operations (media sync, issue report) are then appended to the
//! durable queue instead of discarded, and replayed FIFO once connectivity
//! returns. Queued failures are all retried identically; the design does
//! not try to tell permanent from transient failures up front.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{
    DeletionOutcome, RegisterAgentRequest, RemoteApi, SdCardBinding, SessionEndRequest,
    SessionProgressRequest, SessionStartRequest,
};
use crate::error::AgentError;
use crate::model::{DeletionTask, QueuedWriteKind, SyncQueueItem};
use crate::store::LocalStore;

/// How a designated write was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The backend accepted the write
    Delivered,
    /// Connectivity was down; the write is queued for replay
    Queued,
}

/// Result of one queue replay pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueReplay {
    pub replayed: usize,
    pub requeued: usize,
}

/// Wraps the remote API with online-state tracking and the sync queue.
pub struct SyncGateway {
    api: Arc<dyn RemoteApi>,
    store: Arc<Mutex<LocalStore>>,
    online: AtomicBool,
}

impl SyncGateway {
    pub fn new(api: Arc<dyn RemoteApi>, store: Arc<Mutex<LocalStore>>) -> Self {
        SyncGateway {
            api,
            store,
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Track connectivity from a call result: transient failures flip the
    /// gateway offline, success flips it back.
    fn observe<T>(&self, result: &Result<T, AgentError>) {
        match result {
            Ok(_) => {
                if !self.online.swap(true, Ordering::SeqCst) {
                    info!("connectivity restored");
                }
            }
            Err(e) if e.is_transient() => {
                if self.online.swap(false, Ordering::SeqCst) {
                    warn!(error = %e, "connectivity lost, going offline");
                }
            }
            Err(_) => {}
        }
    }

    // --- pass-through calls ---------------------------------------------

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<(), AgentError> {
        let result = self.api.register_agent(request).await;
        self.observe(&result);
        result
    }

    pub async fn heartbeat(&self, device_id: &str) -> Result<(), AgentError> {
        let result = self.api.heartbeat(device_id).await;
        self.observe(&result);
        result
    }

    pub async fn fetch_agent_config(&self, device_id: &str) -> Result<Value, AgentError> {
        let result = self.api.fetch_agent_config(device_id).await;
        self.observe(&result);
        result
    }

    pub async fn bind_sd_card(&self, binding: &SdCardBinding) -> Result<(), AgentError> {
        let result = self.api.bind_sd_card(binding).await;
        self.observe(&result);
        result
    }

    pub async fn sd_card_bindings(&self, device_id: &str) -> Result<Vec<SdCardBinding>, AgentError> {
        let result = self.api.sd_card_bindings(device_id).await;
        self.observe(&result);
        result
    }

    pub async fn start_session(&self, request: &SessionStartRequest) -> Result<(), AgentError> {
        let result = self.api.start_session(request).await;
        self.observe(&result);
        result
    }

    pub async fn update_progress(
        &self,
        session_id: &Uuid,
        request: &SessionProgressRequest,
    ) -> Result<(), AgentError> {
        let result = self.api.update_progress(session_id, request).await;
        self.observe(&result);
        result
    }

    pub async fn end_session(
        &self,
        session_id: &Uuid,
        request: &SessionEndRequest,
    ) -> Result<(), AgentError> {
        let result = self.api.end_session(session_id, request).await;
        self.observe(&result);
        result
    }

    pub async fn create_backup(&self, payload: &Value) -> Result<(), AgentError> {
        let result = self.api.create_backup(payload).await;
        self.observe(&result);
        result
    }

    pub async fn verify_backup(&self, payload: &Value) -> Result<(), AgentError> {
        let result = self.api.verify_backup(payload).await;
        self.observe(&result);
        result
    }

    pub async fn deletion_tasks(&self, device_id: &str) -> Result<Vec<DeletionTask>, AgentError> {
        let result = self.api.deletion_tasks(device_id).await;
        self.observe(&result);
        result
    }

    pub async fn complete_deletion_task(&self, outcome: &DeletionOutcome) -> Result<(), AgentError> {
        let result = self.api.complete_deletion_task(outcome).await;
        self.observe(&result);
        result
    }

    // --- queueable writes -----------------------------------------------

    /// Report a media file to the backend; queued on connectivity loss.
    pub async fn sync_media(&self, payload: Value) -> Result<SyncOutcome, AgentError> {
        self.queueable(QueuedWriteKind::MediaSync, payload).await
    }

    /// Report an issue to the backend; queued on connectivity loss.
    pub async fn report_issue(&self, payload: Value) -> Result<SyncOutcome, AgentError> {
        self.queueable(QueuedWriteKind::IssueReport, payload).await
    }

    async fn queueable(
        &self,
        kind: QueuedWriteKind,
        payload: Value,
    ) -> Result<SyncOutcome, AgentError> {
        let result = self.dispatch(kind, &payload).await;
        self.observe(&result);
        match result {
            Ok(()) => Ok(SyncOutcome::Delivered),
            Err(e) if e.is_transient() => {
                debug!(%kind, "write deferred to sync queue");
                self.store.lock().push_queue_item(SyncQueueItem {
                    kind,
                    data: payload,
                    timestamp: Utc::now(),
                })?;
                Ok(SyncOutcome::Queued)
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, kind: QueuedWriteKind, payload: &Value) -> Result<(), AgentError> {
        match kind {
            QueuedWriteKind::MediaSync => self.api.sync_media(payload).await,
            QueuedWriteKind::IssueReport => self.api.report_issue(payload).await,
        }
    }

    /// Replay the sync queue in FIFO order. Items that still fail are
    /// re-queued in their original order; successes are gone for good.
    pub async fn process_sync_queue(&self) -> Result<QueueReplay, AgentError> {
        let items = self.store.lock().take_queue()?;
        if items.is_empty() {
            return Ok(QueueReplay::default());
        }

        let mut replay = QueueReplay::default();
        let mut requeue = Vec::new();
        for item in items {
            let result = self.dispatch(item.kind, &item.data).await;
            self.observe(&result);
            match result {
                Ok(()) => replay.replayed += 1,
                Err(e) => {
                    warn!(kind = %item.kind, error = %e, "queued write still failing");
                    requeue.push(item);
                }
            }
        }
        replay.requeued = requeue.len();
        self.store.lock().requeue_front(requeue)?;

        info!(
            replayed = replay.replayed,
            requeued = replay.requeued,
            "sync queue processed"
        );
        Ok(replay)
    }

    /// Probe the backend's liveness endpoint and update the online flag.
    /// A successful probe with queued writes pending triggers a replay.
    pub async fn check_health(&self) -> bool {
        let result = self.api.health().await;
        self.observe(&result);
        let queued = self.store.lock().queue_len();
        if result.is_ok() && queued > 0 {
            if let Err(e) = self.process_sync_queue().await {
                warn!(error = %e, "queue replay failed");
            }
        }
        self.is_online()
    }

    pub fn queue_len(&self) -> usize {
        self.store.lock().queue_len()
    }
}

/// Retry an operation with exponential backoff: bounded attempts, doubling
/// delay. For critical one-shot operations outside the queue path
/// (e.g. agent registration at startup). Only transient failures are
/// retried; an identity or application-level rejection surfaces
/// immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    initial_delay: Duration,
    mut operation: F,
) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let attempts = attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && e.is_transient() => {
                warn!(attempt, error = %e, "operation failed, backing off");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
