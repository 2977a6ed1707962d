//! Agent configuration.
//!
//! Loaded from a TOML file at startup; every section has complete defaults
//! so a missing file or a sparse one still yields a runnable config.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::checksum::{HashAlgorithm, DEFAULT_FULL_HASH_THRESHOLD};
use crate::error::AgentError;
use crate::model::WatchFolderKind;

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub api: ApiConfig,
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    pub volumes: VolumeConfig,
    pub watcher: WatcherConfig,
    pub checksum: ChecksumConfig,
    pub sync: SyncConfig,
    pub deletion: DeletionConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns `AgentError::Config` if the file cannot be read or parsed.
    pub fn load(path: &std::path::Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        data_home().join("config.toml")
    }
}

/// Remote API endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "http://127.0.0.1:8080".to_string(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

/// Identity of this agent installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            device_id: "offload-agent".to_string(),
        }
    }
}

/// Where durable state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub state_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            state_path: data_home().join("state.json"),
        }
    }
}

/// Volume detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Directories whose children are candidate mount points
    pub mount_roots: Vec<PathBuf>,
    pub sd_scan_interval_secs: u64,
    pub backup_scan_interval_secs: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            mount_roots: default_mount_roots(),
            sd_scan_interval_secs: 3,
            backup_scan_interval_secs: 10,
        }
    }
}

/// One folder under watch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchFolder {
    pub path: PathBuf,
    pub kind: WatchFolderKind,
    #[serde(default = "default_true")]
    pub recursive: bool,
}

fn default_true() -> bool {
    true
}

/// File watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub folders: Vec<WatchFolder>,
    pub poll_interval_secs: u64,
    /// Consecutive polls a new file's size must hold steady before its add
    /// event is delivered (filters out partially-written copies)
    pub settle_polls: u32,
    /// Seconds before a registered copy source stops matching new files
    pub registration_ttl_secs: u64,
    /// Video extension allowlist, lowercase
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            folders: Vec::new(),
            poll_interval_secs: 2,
            settle_polls: 2,
            registration_ttl_secs: 300,
            extensions: default_extensions(),
        }
    }
}

/// Checksum settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChecksumConfig {
    pub algorithm: HashAlgorithm,
    pub full_hash_threshold_bytes: u64,
}

impl Default for ChecksumConfig {
    fn default() -> Self {
        ChecksumConfig {
            algorithm: HashAlgorithm::Blake3,
            full_hash_threshold_bytes: DEFAULT_FULL_HASH_THRESHOLD,
        }
    }
}

/// Remote sync cadence and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub heartbeat_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub retry_attempts: u32,
    pub retry_initial_delay_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            heartbeat_interval_secs: 60,
            health_check_interval_secs: 30,
            retry_attempts: 3,
            retry_initial_delay_ms: 500,
        }
    }
}

/// Deletion-task processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionConfig {
    pub interval_secs: u64,
    /// Candidate folders searched when a task's recorded path is stale
    pub media_dirs: Vec<PathBuf>,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        DeletionConfig {
            interval_secs: 300,
            media_dirs: default_media_dirs(),
        }
    }
}

fn data_home() -> PathBuf {
    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("offload");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/offload");
    }
    PathBuf::from(".offload")
}

fn default_mount_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        // Drive letters are enumerated directly by the detector.
        return Vec::new();
    }
    let mut roots = vec![PathBuf::from("/Volumes")];
    if let Ok(home) = std::env::var("HOME") {
        if let Some(user) = PathBuf::from(&home).file_name() {
            roots.push(PathBuf::from("/media").join(user));
            roots.push(PathBuf::from("/run/media").join(user));
        }
    }
    roots.push(PathBuf::from("/media"));
    roots
}

fn default_media_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        dirs.push(home.join("Movies"));
        dirs.push(home.join("Videos"));
    }
    dirs
}

fn default_extensions() -> Vec<String> {
    ["mp4", "mov", "mxf", "avi", "m4v", "mts", "m2ts", "crm", "braw", "r3d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
