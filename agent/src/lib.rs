//! # Offload Agent - Capture/Backup Agent Library
//!
//! The unattended agent behind an on-site media capture workflow: it
//! watches an editor's workstation, notices camera cards coming and going,
//! tracks each card's copy session to completion, verifies backup disks
//! byte-for-byte, and mirrors everything to a remote backend that may or
//! may not be reachable at any given moment.
//!
//! ## Overview
//!
//! - Removable volume detection with stable hardware identities
//! - Per-card copy sessions that survive agent restarts
//! - Destination-folder watching with copy correlation and rename detection
//! - Full/partial checksumming tuned for large video files
//! - Source/backup verification with per-file issue reporting
//! - A sync gateway that queues writes while offline and replays them FIFO
//! - Server-issued deletion tasks processed against local media folders
//!
//! ## Basic Usage
//!
//! ```no_run
//! use agent::{AgentConfig, AgentRuntime};
//!
//! # async fn run() -> Result<(), agent::AgentError> {
//! let config = AgentConfig::load(&AgentConfig::default_path())?;
//! let runtime = AgentRuntime::new(config)?;
//!
//! // Hand the cancellation token to a ctrl-c handler, then run.
//! let token = runtime.cancellation_token();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     token.cancel();
//! });
//! runtime.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Volume, CopySession, reports, tasks)
//! - **error**: Error types and the transient/permanent split
//! - **checksum**: Full and partial (head+tail+size) hashing
//! - **store**: Durable JSON-backed local state
//! - **config**: TOML configuration with complete defaults
//! - **events**: Typed events from detectors to the coordinator
//! - **volume**: Removable volume detection and classification
//! - **watcher**: Watched-folder polling and copy correlation
//! - **session**: Copy-session lifecycle
//! - **verify**: Source/backup verification
//! - **api**: Remote API trait, payloads and the HTTP client
//! - **sync**: Online tracking, sync queue, retry helper
//! - **deletion**: Server-issued deletion tasks
//! - **runtime**: The coordinator loop

pub mod api;
pub mod checksum;
pub mod config;
pub mod deletion;
pub mod error;
pub mod events;
pub mod model;
pub mod runtime;
pub mod session;
pub mod store;
pub mod sync;
pub mod verify;
pub mod volume;
pub mod watcher;

// Re-export main types
pub use api::{HttpApi, RemoteApi};
pub use checksum::{ChecksumEngine, ChecksumValue, HashAlgorithm};
pub use config::AgentConfig;
pub use deletion::DeletionTaskProcessor;
pub use error::AgentError;
pub use events::{AgentEvent, FileEvent, VerifyProgress, VolumeEvent};
pub use model::{
    BackupDiskRegistration, CopySession, DeletionTask, IssueKind, RemovalDecision, SessionStatus,
    TrackedFile, VerificationReport, Volume, VolumeKind,
};
pub use runtime::AgentRuntime;
pub use session::CopySessionManager;
pub use store::LocalStore;
pub use sync::{retry_with_backoff, SyncGateway, SyncOutcome};
pub use verify::BackupVerifier;
pub use volume::VolumeDetector;
pub use watcher::FileWatcher;
