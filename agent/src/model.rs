//! Core data model for the capture agent.
//!
//! This module defines the structures shared across services:
//! - Volume: a detected removable medium (SD card or backup disk)
//! - CopySession: the lifecycle of one card being copied to the workstation
//! - CopyOperation / TrackedFile: watcher-side correlation state
//! - BackupDiskRegistration, VerificationReport, DeletionTask, SyncQueueItem

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::ChecksumValue;

/// What a detected volume is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeKind {
    /// A camera SD card (carries a DCIM/PRIVATE layout)
    Sd,
    /// A registered backup disk
    Backup,
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sd => write!(f, "sd"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// A removable volume currently visible to the detector.
///
/// Identity (`hardware_id`) is stable across unmount/remount of the same
/// physical medium; the in-memory registry is keyed by mount path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Stable identity derived from the OS volume serial where available,
    /// else a salted hash of the mount path
    pub hardware_id: String,

    /// Where the volume is mounted right now
    pub mount_path: PathBuf,

    /// Volume label (last mount path component)
    pub label: String,

    /// SD card or backup disk
    pub kind: VolumeKind,

    /// Number of video files on the volume
    pub file_count: u64,

    /// Total size of those files in bytes
    pub total_size_bytes: u64,

    /// When this volume was first seen by the current process
    pub detected_at: DateTime<Utc>,
}

/// Status of a copy session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Files are still expected to arrive
    Active,
    /// Ended with nothing pending
    Completed,
    /// Ended while files were still pending
    EarlyRemoved,
}

impl SessionStatus {
    /// Returns true if this status is terminal (the session cannot restart).
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::EarlyRemoved)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::EarlyRemoved => write!(f, "early_removed"),
        }
    }
}

/// What the operator said when the card was pulled.
///
/// The decision records intent; the final session status records the actual
/// outcome and is derived solely from the pending count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalDecision {
    /// Nothing was pending when the card was removed
    Safe,
    /// The operator confirmed removal with files still pending
    EarlyConfirmed,
}

impl fmt::Display for RemovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::EarlyConfirmed => write!(f, "early_confirmed"),
        }
    }
}

/// One card-copy session.
///
/// At most one Active session exists per `sd_hardware_id`. Persisted to the
/// local store on every mutation so an agent crash mid-copy can restore the
/// session at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopySession {
    pub session_id: Uuid,
    pub sd_hardware_id: String,
    pub camera_number: Option<u32>,
    pub sd_label: String,
    pub files_detected: u64,
    pub files_copied: u64,
    pub files_pending: u64,
    pub total_size_bytes: u64,
    pub status: SessionStatus,
    pub removal_decision: Option<RemovalDecision>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Whether the remote side has confirmed this session
    pub synced: bool,
}

impl CopySession {
    /// Create a new active session for a just-inserted card.
    pub fn start(volume: &Volume, camera_number: Option<u32>) -> Self {
        CopySession {
            session_id: Uuid::new_v4(),
            sd_hardware_id: volume.hardware_id.clone(),
            camera_number,
            sd_label: volume.label.clone(),
            files_detected: volume.file_count,
            files_copied: 0,
            files_pending: volume.file_count,
            total_size_bytes: volume.total_size_bytes,
            status: SessionStatus::Active,
            removal_decision: None,
            started_at: Utc::now(),
            ended_at: None,
            synced: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Record one correlated file arrival. `files_copied` is monotonic and
    /// `files_pending` never goes negative even if more files arrive than
    /// were detected on the card.
    pub fn record_copied(&mut self) {
        self.files_copied += 1;
        self.files_pending = self.files_detected.saturating_sub(self.files_copied);
    }

    /// Update the detected totals after the card has been enumerated.
    /// Detected counts only grow; a rescan can never reduce progress.
    pub fn update_detected(&mut self, files_detected: u64, total_size_bytes: u64) {
        self.files_detected = self.files_detected.max(files_detected);
        self.total_size_bytes = self.total_size_bytes.max(total_size_bytes);
        self.files_pending = self.files_detected.saturating_sub(self.files_copied);
    }

    /// The terminal status this session would take if ended right now:
    /// Completed iff nothing is pending, EarlyRemoved otherwise.
    pub fn terminal_status(&self) -> SessionStatus {
        if self.files_pending == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::EarlyRemoved
        }
    }
}

/// A registered expectation that a known SD source file is about to be
/// copied into a watched folder. Short-lived and in-memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOperation {
    pub source_path: PathBuf,
    /// Hardware id of the volume the source lives on
    pub source_device: String,
    pub size: u64,
    pub checksum: ChecksumValue,
    pub registered_at: DateTime<Utc>,
}

impl CopyOperation {
    /// True once the registration is older than the TTL and must no longer
    /// match new files.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        now - self.registered_at > ttl
    }
}

/// Which kind of folder a watch entry covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchFolderKind {
    /// The workstation folder cards are copied into
    Ingest,
    /// A backup destination folder
    Backup,
}

impl fmt::Display for WatchFolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Backup => write!(f, "backup"),
        }
    }
}

/// Last known state of a file under watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedFile {
    pub name: String,
    pub folder: PathBuf,
    pub folder_kind: WatchFolderKind,
    pub size: u64,
    pub checksum: ChecksumValue,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TrackedFile {
    pub fn path(&self) -> PathBuf {
        self.folder.join(&self.name)
    }
}

/// A disk that has been explicitly trusted as a backup target.
///
/// Written as JSON to a marker file at the disk root, so the disk
/// re-identifies itself on any machine it is plugged into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDiskRegistration {
    /// Hardware id of the disk at registration time
    pub disk_id: String,
    pub name: String,
    pub registered_at: DateTime<Utc>,
}

/// Kind of per-file problem found during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    SizeMismatch,
    ChecksumMismatch,
    Missing,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch => write!(f, "size_mismatch"),
            Self::ChecksumMismatch => write!(f, "checksum_mismatch"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

/// One problem file in a verification report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIssue {
    /// Path relative to the source root
    pub file: PathBuf,
    pub issue: IssueKind,
}

/// Outcome of one verification pass over a source/backup folder pair.
/// Produced per run; the durable backup-confirmed state lives server-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationReport {
    pub total: u64,
    pub matched: u64,
    pub failed: u64,
    pub issues: Vec<FileIssue>,
}

impl VerificationReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn record_match(&mut self) {
        self.matched += 1;
    }

    pub fn record_issue(&mut self, file: PathBuf, issue: IssueKind) {
        self.failed += 1;
        self.issues.push(FileIssue { file, issue });
    }
}

/// Status of a server-issued deletion task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A server-issued retention task. The server is the authority on when it
/// is safe to delete; the agent only caches tasks for offline processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionTask {
    pub id: String,
    pub event_id: String,
    pub media_id: String,
    pub device_id: String,
    pub file_path: PathBuf,
    pub status: DeletionStatus,
}

/// Kind of deferred remote write held in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedWriteKind {
    MediaSync,
    IssueReport,
}

impl fmt::Display for QueuedWriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MediaSync => write!(f, "media_sync"),
            Self::IssueReport => write!(f, "issue_report"),
        }
    }
}

/// An API write deferred due to connectivity loss; replayed FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub kind: QueuedWriteKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
