//! Offload - command-line front end for the capture/backup agent.
//!
//! `offload run` starts the long-running agent; the other subcommands are
//! one-shot maintenance tools (backup verification, disk registration,
//! local status) that operate on the same configuration and local state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use agent::{
    AgentConfig, AgentRuntime, BackupVerifier, ChecksumEngine, HttpApi, LocalStore, SyncGateway,
    VerificationReport, VolumeDetector,
};

/// Offload - on-site media capture and backup agent
#[derive(Parser, Debug)]
#[command(name = "offload")]
#[command(version)]
#[command(about = "Detect camera cards, track copy sessions, verify backups")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent until interrupted
    Run,

    /// Verify a backup folder against its source, file by file
    Verify {
        /// Source folder (the workstation copy)
        #[arg(long, value_name = "PATH")]
        source: PathBuf,

        /// Backup folder to check
        #[arg(long, value_name = "PATH")]
        backup: PathBuf,
    },

    /// Register a mounted disk as a trusted backup target
    RegisterDisk {
        /// Mount point of the disk
        #[arg(long, value_name = "PATH")]
        mount: PathBuf,

        /// Human-readable disk name
        #[arg(long, value_name = "NAME")]
        name: String,
    },

    /// Associate a mounted SD card with a camera number
    BindCard {
        /// Mount point of the card
        #[arg(long, value_name = "PATH")]
        mount: PathBuf,

        /// Camera number the card belongs to
        #[arg(long, value_name = "N")]
        camera: u32,
    },

    /// Show local sessions, registered disks and queued writes
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .init();

    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            2
        }
    };

    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            let runtime = AgentRuntime::new(config).context("cannot start agent")?;
            let token = runtime.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    token.cancel();
                }
            });
            runtime.run().await.context("agent stopped with an error")?;
            Ok(0)
        }
        Commands::Verify { source, backup } => run_verify(&config, &source, &backup).await,
        Commands::RegisterDisk { mount, name } => {
            run_register_disk(&config, &mount, &name).await
        }
        Commands::BindCard { mount, camera } => run_bind_card(&config, &mount, camera).await,
        Commands::Status => run_status(&config),
    }
}

/// Load configuration: an explicit path must parse; the default path may be
/// absent, in which case built-in defaults apply.
fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    match path {
        Some(path) => {
            AgentConfig::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let default = AgentConfig::default_path();
            if default.exists() {
                AgentConfig::load(&default)
                    .with_context(|| format!("loading {}", default.display()))
            } else {
                Ok(AgentConfig::default())
            }
        }
    }
}

/// One-shot verification. Exit code 1 when any file fails, mirroring
/// "this backup is not certifiable". The result is also reported to the
/// backend, which owns the actual verified-state transition.
async fn run_verify(config: &AgentConfig, source: &Path, backup: &Path) -> anyhow::Result<i32> {
    let report = verify_locally(config, source, backup)?;
    print_report(&report);
    report_verification(config, source, backup, &report).await;
    Ok(if report.success() { 0 } else { 1 })
}

/// Walk and compare the folder pair, with progress on stderr.
fn verify_locally(
    config: &AgentConfig,
    source: &Path,
    backup: &Path,
) -> anyhow::Result<VerificationReport> {
    if !source.is_dir() {
        anyhow::bail!("source folder does not exist: {}", source.display());
    }
    if !backup.is_dir() {
        anyhow::bail!("backup folder does not exist: {}", backup.display());
    }

    let engine = ChecksumEngine::new(
        config.checksum.algorithm,
        config.checksum.full_hash_threshold_bytes,
    );
    let verifier = BackupVerifier::new(engine, config.watcher.extensions.clone());

    eprintln!("Verifying backup...");
    eprintln!("  Source: {}", source.display());
    eprintln!("  Backup: {}", backup.display());

    let report = verifier
        .verify(source, backup, |progress| {
            eprint!(
                "\r[{}/{}] {}",
                progress.processed,
                progress.total,
                progress.current.display()
            );
            let _ = std::io::Write::flush(&mut std::io::stderr());
        })
        .context("verification failed to run")?;
    eprintln!();
    Ok(report)
}

fn print_report(report: &VerificationReport) {
    eprintln!(
        "Checked {} files: {} matched, {} failed",
        report.total, report.matched, report.failed
    );
    if !report.issues.is_empty() {
        eprintln!();
        eprintln!("Problem files:");
        for issue in &report.issues {
            eprintln!("  {}: {}", issue.file.display(), issue.issue);
        }
    }
}

/// Report the verification outcome to the backend, best-effort. Failed
/// files additionally go out as issue reports, which survive offline in
/// the sync queue.
async fn report_verification(
    config: &AgentConfig,
    source: &Path,
    backup: &Path,
    report: &VerificationReport,
) {
    let Some(gateway) = gateway_for(config) else {
        debug!("no api token configured, skipping remote report");
        return;
    };

    let payload = serde_json::json!({
        "device_id": config.device.device_id,
        "source": source.display().to_string(),
        "backup": backup.display().to_string(),
        "total": report.total,
        "matched": report.matched,
        "failed": report.failed,
        "success": report.success(),
        "issues": report.issues,
    });
    if let Err(e) = gateway.verify_backup(&payload).await {
        warn!(error = %e, "verification result not recorded remotely");
    }

    for issue in &report.issues {
        let payload = serde_json::json!({
            "device_id": config.device.device_id,
            "category": "backup_verification",
            "message": issue.issue.to_string(),
            "file": issue.file.display().to_string(),
        });
        if let Err(e) = gateway.report_issue(payload).await {
            warn!(file = %issue.file.display(), error = %e, "issue report rejected");
        }
    }
}

async fn run_register_disk(
    config: &AgentConfig,
    mount: &Path,
    name: &str,
) -> anyhow::Result<i32> {
    if !mount.is_dir() {
        anyhow::bail!("mount point does not exist: {}", mount.display());
    }

    let store = Arc::new(Mutex::new(LocalStore::open(&config.storage.state_path)?));
    let detector = VolumeDetector::new(
        config.volumes.mount_roots.clone(),
        config.watcher.extensions.clone(),
        store,
    )?;

    let registration = detector
        .register_backup_disk(mount, name)
        .context("cannot register disk")?;
    println!(
        "Registered backup disk '{}' as {}",
        registration.name, registration.disk_id
    );

    if let Some(gateway) = gateway_for(config) {
        let payload = serde_json::json!({
            "disk_id": registration.disk_id,
            "name": registration.name,
            "device_id": config.device.device_id,
        });
        if let Err(e) = gateway.create_backup(&payload).await {
            warn!(error = %e, "backup record not created remotely");
        }
    }
    Ok(0)
}

/// Bindings are server-side state; the card only needs to be mounted so
/// its hardware id can be derived.
async fn run_bind_card(config: &AgentConfig, mount: &Path, camera: u32) -> anyhow::Result<i32> {
    if !mount.is_dir() {
        anyhow::bail!("mount point does not exist: {}", mount.display());
    }
    let Some(gateway) = gateway_for(config) else {
        anyhow::bail!("an api token is required to bind cards");
    };

    let store = Arc::new(Mutex::new(LocalStore::open(&config.storage.state_path)?));
    let detector = VolumeDetector::new(
        config.volumes.mount_roots.clone(),
        config.watcher.extensions.clone(),
        store,
    )?;
    let hardware_id = detector.hardware_id(mount);

    let binding = agent::api::SdCardBinding {
        device_id: config.device.device_id.clone(),
        hardware_id: hardware_id.clone(),
        camera_number: camera,
    };
    gateway
        .bind_sd_card(&binding)
        .await
        .context("cannot bind card")?;
    println!("Bound card {hardware_id} to camera {camera}");
    Ok(0)
}

/// A gateway for one-shot commands, or None when no token is configured
/// (nothing useful to say to a backend we cannot authenticate against).
fn gateway_for(config: &AgentConfig) -> Option<SyncGateway> {
    if config.api.token.is_empty() {
        return None;
    }
    let api = match HttpApi::new(&config.api) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            warn!(error = %e, "cannot build api client");
            return None;
        }
    };
    let store = match LocalStore::open(&config.storage.state_path) {
        Ok(store) => Arc::new(Mutex::new(store)),
        Err(e) => {
            warn!(error = %e, "cannot open local store");
            return None;
        }
    };
    Some(SyncGateway::new(api, store))
}

fn run_status(config: &AgentConfig) -> anyhow::Result<i32> {
    let store = LocalStore::open(&config.storage.state_path)?;

    let sessions = store.sessions();
    if sessions.is_empty() {
        println!("No sessions recorded.");
    } else {
        println!("Sessions:");
        for session in &sessions {
            println!(
                "  {} [{}] {} - {}/{} copied, {} pending{}",
                session.session_id,
                session.status,
                session.sd_label,
                session.files_copied,
                session.files_detected,
                session.files_pending,
                if session.synced { "" } else { " (not synced)" }
            );
        }
    }

    let disks = store.disks();
    if !disks.is_empty() {
        println!("Backup disks:");
        for disk in &disks {
            println!("  {} - {}", disk.disk_id, disk.name);
        }
    }

    let queued = store.queue_len();
    if queued > 0 {
        println!("{queued} write(s) waiting for connectivity.");
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_config(dir: &tempfile::TempDir) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.storage.state_path = dir.path().join("state.json");
        config
    }

    fn make_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (rel, contents) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().expect("parent")).expect("Failed to create dirs");
            fs::write(&path, contents).expect("Failed to write file");
        }
    }

    #[test]
    fn test_verify_clean_backup_succeeds() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = dir.path().join("src");
        let backup = dir.path().join("bak");
        let files: &[(&str, &[u8])] = &[("a.mp4", b"one"), ("cam2/b.mov", b"two")];
        make_tree(&source, files);
        make_tree(&backup, files);

        let report =
            verify_locally(&test_config(&dir), &source, &backup).expect("verify runs");
        assert!(report.success());
        assert_eq!(report.matched, 2);
    }

    #[tokio::test]
    async fn test_verify_bad_backup_exits_one() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let source = dir.path().join("src");
        let backup = dir.path().join("bak");
        make_tree(&source, &[("a.mp4", b"one" as &[u8]), ("b.mp4", b"two")]);
        make_tree(&backup, &[("a.mp4", b"one" as &[u8])]);

        // Default config has no token: nothing is reported remotely.
        let code = run_verify(&test_config(&dir), &source, &backup)
            .await
            .expect("verify runs");
        assert_eq!(code, 1);
    }

    #[test]
    fn test_verify_rejects_missing_source() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = verify_locally(
            &test_config(&dir),
            &dir.path().join("nope"),
            &dir.path().join("bak"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_register_disk_writes_marker() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mount = dir.path().join("disk");
        fs::create_dir_all(&mount).expect("Failed to create mount");

        let code = run_register_disk(&test_config(&dir), &mount, "Vault A")
            .await
            .expect("registration runs");
        assert_eq!(code, 0);
        assert!(mount.join(".offload-backup.json").exists());
    }

    #[tokio::test]
    async fn test_bind_card_requires_token() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mount = dir.path().join("card");
        fs::create_dir_all(&mount).expect("Failed to create mount");

        let result = run_bind_card(&test_config(&dir), &mount, 2).await;
        assert!(result.is_err(), "binding without a token must be rejected");
    }

    #[test]
    fn test_status_on_empty_store() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let code = run_status(&test_config(&dir)).expect("status runs");
        assert_eq!(code, 0);
    }

    #[test]
    fn test_load_config_explicit_path_must_exist() {
        let result = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
    }
}
