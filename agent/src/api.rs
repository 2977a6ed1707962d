//! Remote API surface.
//!
//! Everything the agent says to the backend goes through the `RemoteApi`
//! trait, so services can be tested against an in-memory fake. The
//! production implementation is a reqwest client with bearer auth and a
//! fixed request timeout; anything slower than the timeout is a network
//! failure, not something to wait on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::error::AgentError;
use crate::model::{DeletionStatus, DeletionTask, RemovalDecision, SessionStatus};

/// Agent self-registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAgentRequest {
    pub device_id: String,
    pub hostname: String,
    pub version: String,
}

/// Association of an SD card with a camera number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdCardBinding {
    pub device_id: String,
    pub hardware_id: String,
    pub camera_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartRequest {
    pub session_id: Uuid,
    pub device_id: String,
    pub sd_hardware_id: String,
    pub camera_number: Option<u32>,
    pub sd_label: String,
    pub files_detected: u64,
    pub total_size_bytes: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProgressRequest {
    pub files_detected: u64,
    pub files_copied: u64,
    pub files_pending: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEndRequest {
    pub status: SessionStatus,
    pub removal_decision: RemovalDecision,
    pub files_pending: u64,
    pub ended_at: DateTime<Utc>,
}

/// One media file reported to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSyncRecord {
    pub device_id: String,
    pub session_id: Option<Uuid>,
    pub file_name: String,
    pub folder: String,
    pub size: u64,
    pub checksum: String,
    pub modified_at: DateTime<Utc>,
}

/// A problem the agent wants a human to see (verification failures etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueReportRecord {
    pub device_id: String,
    pub category: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// Outcome report for a server-issued deletion task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionOutcome {
    pub task_id: String,
    pub status: DeletionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The remote endpoints the agent consumes.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<(), AgentError>;
    async fn heartbeat(&self, device_id: &str) -> Result<(), AgentError>;
    async fn fetch_agent_config(&self, device_id: &str) -> Result<Value, AgentError>;
    async fn bind_sd_card(&self, binding: &SdCardBinding) -> Result<(), AgentError>;
    async fn sd_card_bindings(&self, device_id: &str) -> Result<Vec<SdCardBinding>, AgentError>;

    async fn start_session(&self, request: &SessionStartRequest) -> Result<(), AgentError>;
    async fn update_progress(
        &self,
        session_id: &Uuid,
        request: &SessionProgressRequest,
    ) -> Result<(), AgentError>;
    async fn end_session(
        &self,
        session_id: &Uuid,
        request: &SessionEndRequest,
    ) -> Result<(), AgentError>;

    async fn sync_media(&self, payload: &Value) -> Result<(), AgentError>;
    async fn batch_sync_media(&self, payloads: &[Value]) -> Result<(), AgentError>;
    async fn report_issue(&self, payload: &Value) -> Result<(), AgentError>;

    async fn create_backup(&self, payload: &Value) -> Result<(), AgentError>;
    async fn verify_backup(&self, payload: &Value) -> Result<(), AgentError>;

    async fn deletion_tasks(&self, device_id: &str) -> Result<Vec<DeletionTask>, AgentError>;
    async fn complete_deletion_task(&self, outcome: &DeletionOutcome) -> Result<(), AgentError>;

    async fn health(&self) -> Result<(), AgentError>;
}

/// reqwest-backed implementation of `RemoteApi`.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(config: &ApiConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("cannot build http client: {e}")))?;
        Ok(HttpApi {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request, mapping connectivity loss to `Network` and
    /// non-success statuses to `Identity`/`Api`.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        operation: &str,
    ) -> Result<reqwest::Response, AgentError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| AgentError::network(operation, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::CONFLICT => {
                Err(AgentError::Identity(format!("{operation}: {status}: {message}")))
            }
            _ => Err(AgentError::Api {
                operation: operation.to_string(),
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        operation: &str,
    ) -> Result<(), AgentError> {
        self.execute(self.client.post(self.url(path)).json(body), operation)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<(), AgentError> {
        self.post_json("/agent/register", request, "agent.register").await
    }

    async fn heartbeat(&self, device_id: &str) -> Result<(), AgentError> {
        self.post_json(
            "/agent/heartbeat",
            &serde_json::json!({ "device_id": device_id }),
            "agent.heartbeat",
        )
        .await
    }

    async fn fetch_agent_config(&self, device_id: &str) -> Result<Value, AgentError> {
        let operation = "agent.config";
        let request = self
            .client
            .post(self.url("/agent/config"))
            .json(&serde_json::json!({ "device_id": device_id }));
        let response = self.execute(request, operation).await?;
        response.json().await.map_err(|e| AgentError::Response {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    async fn bind_sd_card(&self, binding: &SdCardBinding) -> Result<(), AgentError> {
        self.post_json("/agent/sd-card/bind", binding, "agent.sd_card.bind").await
    }

    async fn sd_card_bindings(&self, device_id: &str) -> Result<Vec<SdCardBinding>, AgentError> {
        let operation = "agent.sd_card.list";
        let request = self
            .client
            .get(self.url("/agent/sd-card"))
            .query(&[("device_id", device_id)]);
        let response = self.execute(request, operation).await?;
        response.json().await.map_err(|e| AgentError::Response {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    async fn start_session(&self, request: &SessionStartRequest) -> Result<(), AgentError> {
        self.post_json("/session/start", request, "session.start").await
    }

    async fn update_progress(
        &self,
        session_id: &Uuid,
        request: &SessionProgressRequest,
    ) -> Result<(), AgentError> {
        let operation = "session.progress";
        let path = format!("/session/{session_id}/progress");
        self.execute(self.client.put(self.url(&path)).json(request), operation)
            .await
            .map(|_| ())
    }

    async fn end_session(
        &self,
        session_id: &Uuid,
        request: &SessionEndRequest,
    ) -> Result<(), AgentError> {
        let path = format!("/session/{session_id}/end");
        self.post_json(&path, request, "session.end").await
    }

    async fn sync_media(&self, payload: &Value) -> Result<(), AgentError> {
        self.post_json("/media/sync", payload, "media.sync").await
    }

    async fn batch_sync_media(&self, payloads: &[Value]) -> Result<(), AgentError> {
        self.post_json("/media/batch-sync", payloads, "media.batch_sync").await
    }

    async fn report_issue(&self, payload: &Value) -> Result<(), AgentError> {
        self.post_json("/issues/report", payload, "issues.report").await
    }

    async fn create_backup(&self, payload: &Value) -> Result<(), AgentError> {
        self.post_json("/backup/create", payload, "backup.create").await
    }

    async fn verify_backup(&self, payload: &Value) -> Result<(), AgentError> {
        self.post_json("/backup/verify", payload, "backup.verify").await
    }

    async fn deletion_tasks(&self, device_id: &str) -> Result<Vec<DeletionTask>, AgentError> {
        let operation = "media_deletion.tasks";
        let request = self
            .client
            .get(self.url("/media-deletion/tasks"))
            .query(&[("device_id", device_id)]);
        let response = self.execute(request, operation).await?;
        response.json().await.map_err(|e| AgentError::Response {
            operation: operation.to_string(),
            message: e.to_string(),
        })
    }

    async fn complete_deletion_task(&self, outcome: &DeletionOutcome) -> Result<(), AgentError> {
        self.post_json(
            "/media-deletion/tasks/complete",
            outcome,
            "media_deletion.complete",
        )
        .await
    }

    async fn health(&self) -> Result<(), AgentError> {
        self.execute(self.client.get(self.url("/health")), "health")
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory fake of the remote API with scriptable connectivity.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    pub struct MockApi {
        pub network_down: AtomicBool,
        pub calls: Mutex<Vec<String>>,
        pub rejections: Mutex<std::collections::HashSet<String>>,
        pub tasks: Mutex<Vec<DeletionTask>>,
        pub bindings: Mutex<Vec<SdCardBinding>>,
        pub synced_media: Mutex<Vec<Value>>,
    }

    impl MockApi {
        pub fn set_network_down(&self, down: bool) {
            self.network_down.store(down, Ordering::SeqCst);
        }

        /// Make the named operation fail with an application-level error
        /// (a non-transient rejection) instead of succeeding.
        pub fn reject(&self, name: &str) {
            self.rejections.lock().insert(name.to_string());
        }

        pub fn call_count(&self, name: &str) -> usize {
            self.calls.lock().iter().filter(|c| *c == name).count()
        }

        fn gate(&self, name: &str) -> Result<(), AgentError> {
            self.calls.lock().push(name.to_string());
            if self.network_down.load(Ordering::SeqCst) {
                return Err(AgentError::network(name, "connection refused"));
            }
            if self.rejections.lock().contains(name) {
                return Err(AgentError::Api {
                    operation: name.to_string(),
                    status: 422,
                    message: "rejected by test".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteApi for MockApi {
        async fn register_agent(&self, _request: &RegisterAgentRequest) -> Result<(), AgentError> {
            self.gate("agent.register")
        }

        async fn heartbeat(&self, _device_id: &str) -> Result<(), AgentError> {
            self.gate("agent.heartbeat")
        }

        async fn fetch_agent_config(&self, _device_id: &str) -> Result<Value, AgentError> {
            self.gate("agent.config")?;
            Ok(serde_json::json!({}))
        }

        async fn bind_sd_card(&self, _binding: &SdCardBinding) -> Result<(), AgentError> {
            self.gate("agent.sd_card.bind")
        }

        async fn sd_card_bindings(
            &self,
            _device_id: &str,
        ) -> Result<Vec<SdCardBinding>, AgentError> {
            self.gate("agent.sd_card.list")?;
            Ok(self.bindings.lock().clone())
        }

        async fn start_session(&self, _request: &SessionStartRequest) -> Result<(), AgentError> {
            self.gate("session.start")
        }

        async fn update_progress(
            &self,
            _session_id: &Uuid,
            _request: &SessionProgressRequest,
        ) -> Result<(), AgentError> {
            self.gate("session.progress")
        }

        async fn end_session(
            &self,
            _session_id: &Uuid,
            _request: &SessionEndRequest,
        ) -> Result<(), AgentError> {
            self.gate("session.end")
        }

        async fn sync_media(&self, payload: &Value) -> Result<(), AgentError> {
            self.gate("media.sync")?;
            self.synced_media.lock().push(payload.clone());
            Ok(())
        }

        async fn batch_sync_media(&self, _payloads: &[Value]) -> Result<(), AgentError> {
            self.gate("media.batch_sync")
        }

        async fn report_issue(&self, _payload: &Value) -> Result<(), AgentError> {
            self.gate("issues.report")
        }

        async fn create_backup(&self, _payload: &Value) -> Result<(), AgentError> {
            self.gate("backup.create")
        }

        async fn verify_backup(&self, _payload: &Value) -> Result<(), AgentError> {
            self.gate("backup.verify")
        }

        async fn deletion_tasks(&self, _device_id: &str) -> Result<Vec<DeletionTask>, AgentError> {
            self.gate("media_deletion.tasks")?;
            Ok(self.tasks.lock().clone())
        }

        async fn complete_deletion_task(
            &self,
            _outcome: &DeletionOutcome,
        ) -> Result<(), AgentError> {
            self.gate("media_deletion.complete")
        }

        async fn health(&self) -> Result<(), AgentError> {
            self.gate("health")
        }
    }
}
