//! Removable volume detection.
//!
//! The detector polls candidate mount points under configured roots, derives
//! a stable hardware identity for each volume, classifies it as an SD card
//! or a registered backup disk, and reports inserted/removed events by
//! diffing against the previous scan's registry.
//!
//! Enumeration failures are logged and produce an empty tick; they never
//! stop the next tick. At most one scan runs at a time; an overlapping scan
//! request is dropped, not queued.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::checksum::ChecksumEngine;
use crate::error::AgentError;
use crate::events::VolumeEvent;
use crate::model::{BackupDiskRegistration, CopyOperation, Volume, VolumeKind};
use crate::store::LocalStore;

/// Name of the self-description file at the root of a registered backup
/// disk. Lets the disk re-identify itself on any machine.
pub const MARKER_FILE_NAME: &str = ".offload-backup.json";

/// Polls the OS for removable volumes and tracks what is mounted.
pub struct VolumeDetector {
    mount_roots: Vec<PathBuf>,
    extensions: Vec<String>,
    store: Arc<Mutex<LocalStore>>,
    salt: String,
    registry: Mutex<HashMap<PathBuf, Volume>>,
    scanning: AtomicBool,
}

impl VolumeDetector {
    pub fn new(
        mount_roots: Vec<PathBuf>,
        extensions: Vec<String>,
        store: Arc<Mutex<LocalStore>>,
    ) -> Result<Self, AgentError> {
        let salt = store.lock().fallback_salt()?;
        Ok(VolumeDetector {
            mount_roots,
            extensions,
            store,
            salt,
            registry: Mutex::new(HashMap::new()),
            scanning: AtomicBool::new(false),
        })
    }

    /// Run one scan for volumes of `kind`, returning inserted/removed
    /// events relative to the previous scan.
    ///
    /// If a scan is already in flight the call returns no events; slow OS
    /// enumeration must not pile up behind timers.
    pub fn scan(&self, kind: VolumeKind) -> Vec<VolumeEvent> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%kind, "scan already in flight, skipping tick");
            return Vec::new();
        }

        let events = self.scan_inner(kind);
        self.scanning.store(false, Ordering::SeqCst);
        events
    }

    fn scan_inner(&self, kind: VolumeKind) -> Vec<VolumeEvent> {
        let mut current: HashMap<PathBuf, Volume> = HashMap::new();

        for mount in self.candidate_mounts() {
            match self.classify(&mount) {
                Some(k) if k == kind => {}
                _ => continue,
            }

            let hardware_id = self.hardware_id(&mount);
            let (file_count, total_size_bytes) = volume_stats(&mount, &self.extensions);
            let label = mount
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| mount.display().to_string());

            current.insert(
                mount.clone(),
                Volume {
                    hardware_id,
                    mount_path: mount,
                    label,
                    kind,
                    file_count,
                    total_size_bytes,
                    detected_at: Utc::now(),
                },
            );
        }

        let mut events = Vec::new();
        let mut registry = self.registry.lock();

        let gone: Vec<PathBuf> = registry
            .iter()
            .filter(|(path, vol)| vol.kind == kind && !current.contains_key(*path))
            .map(|(path, _)| path.clone())
            .collect();
        for path in gone {
            if let Some(volume) = registry.remove(&path) {
                info!(label = %volume.label, hardware_id = %volume.hardware_id, "volume removed");
                events.push(VolumeEvent::Removed(volume));
            }
        }

        for (path, volume) in current {
            if !registry.contains_key(&path) {
                info!(
                    label = %volume.label,
                    hardware_id = %volume.hardware_id,
                    files = volume.file_count,
                    "volume inserted"
                );
                registry.insert(path, volume.clone());
                events.push(VolumeEvent::Inserted(volume));
            }
        }

        events
    }

    /// Currently known volumes, all kinds.
    pub fn known_volumes(&self) -> Vec<Volume> {
        self.registry.lock().values().cloned().collect()
    }

    /// Candidate mount points: children (and grandchildren, for layouts
    /// like `/media/<user>/<volume>`) of each configured root. On Windows,
    /// drive letters are probed directly.
    fn candidate_mounts(&self) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if cfg!(windows) {
            for letter in b'D'..=b'Z' {
                let path = PathBuf::from(format!("{}:\\", letter as char));
                if path.is_dir() {
                    candidates.push(path);
                }
            }
        }

        for root in &self.mount_roots {
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(root = %root.display(), error = %e, "cannot enumerate mount root");
                    }
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                candidates.push(path.clone());
                if let Ok(children) = fs::read_dir(&path) {
                    for child in children.flatten() {
                        let child = child.path();
                        if child.is_dir() {
                            candidates.push(child);
                        }
                    }
                }
            }
        }

        candidates
    }

    /// Classify a mount point. Registration (by id or marker file) wins
    /// over the camera-layout guess, so a backup disk that happens to carry
    /// a DCIM folder is still a backup disk.
    fn classify(&self, mount: &Path) -> Option<VolumeKind> {
        let hardware_id = self.hardware_id(mount);
        if self.store.lock().is_registered_disk(&hardware_id) {
            return Some(VolumeKind::Backup);
        }
        if let Some(marker) = read_marker(mount) {
            // A marked disk is trusted even if it was registered elsewhere;
            // adopt the registration locally so the id lookup works next time.
            if !self.store.lock().is_registered_disk(&marker.disk_id) {
                if let Err(e) = self.store.lock().register_disk(&marker) {
                    warn!(error = %e, "could not adopt marker registration");
                }
            }
            return Some(VolumeKind::Backup);
        }
        if mount.join("DCIM").is_dir() || mount.join("PRIVATE").is_dir() {
            return Some(VolumeKind::Sd);
        }
        None
    }

    /// Derive the stable hardware identity for a mount point.
    ///
    /// Uses the OS volume serial where the platform exposes one; otherwise
    /// hashes the mount path together with the persisted fallback salt, so
    /// the same card at the same mount point keeps its id across restarts.
    pub fn hardware_id(&self, mount: &Path) -> String {
        if let Some(serial) = platform::volume_serial(mount) {
            return format!("vsn-{serial:08x}");
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(mount.to_string_lossy().as_bytes());
        let hex = hasher.finalize().to_hex();
        format!("fp-{}", &hex.as_str()[..16])
    }

    /// Register a mounted disk as a trusted backup target: persist the
    /// registration and write the marker file to the disk root.
    pub fn register_backup_disk(
        &self,
        mount: &Path,
        name: &str,
    ) -> Result<BackupDiskRegistration, AgentError> {
        let registration = BackupDiskRegistration {
            disk_id: self.hardware_id(mount),
            name: name.to_string(),
            registered_at: Utc::now(),
        };

        let marker_path = mount.join(MARKER_FILE_NAME);
        let contents =
            serde_json::to_string_pretty(&registration).map_err(AgentError::StoreFormat)?;
        fs::write(&marker_path, contents).map_err(|e| AgentError::Write {
            path: marker_path,
            source: e,
        })?;

        self.store.lock().register_disk(&registration)?;
        Ok(registration)
    }
}

/// Read and parse the marker file at a disk root, if present and valid.
pub fn read_marker(mount: &Path) -> Option<BackupDiskRegistration> {
    let path = mount.join(MARKER_FILE_NAME);
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(registration) => Some(registration),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable backup marker");
            None
        }
    }
}

/// Count video files and total bytes on a volume. Walk errors are skipped;
/// a half-readable card still yields usable stats.
fn volume_stats(mount: &Path, extensions: &[String]) -> (u64, u64) {
    let mut count = 0u64;
    let mut size = 0u64;
    for entry in WalkDir::new(mount).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        if !has_allowed_extension(entry.path(), extensions) {
            continue;
        }
        if let Ok(metadata) = entry.metadata() {
            count += 1;
            size += metadata.len();
        }
    }
    (count, size)
}

/// Whether a path carries one of the allowlisted (lowercase) extensions.
pub fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            extensions.iter().any(|allowed| *allowed == ext)
        })
        .unwrap_or(false)
}

/// Enumerate the video files on an inserted card as copy-source
/// registrations, so destination arrivals can be correlated back to it.
/// Returns the registrations plus the card's file count and total bytes.
pub fn enumerate_copy_sources(
    mount: &Path,
    hardware_id: &str,
    extensions: &[String],
    engine: &ChecksumEngine,
) -> (Vec<CopyOperation>, u64, u64) {
    let mut operations = Vec::new();
    let mut count = 0u64;
    let mut total = 0u64;

    for entry in WalkDir::new(mount).into_iter().flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !has_allowed_extension(path, extensions) {
            continue;
        }
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable card file");
                continue;
            }
        };
        count += 1;
        total += size;

        match engine.checksum_file(path) {
            Ok(checksum) => operations.push(CopyOperation {
                source_path: path.to_path_buf(),
                source_device: hardware_id.to_string(),
                size,
                checksum,
                registered_at: Utc::now(),
            }),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot hash card file"),
        }
    }

    (operations, count, total)
}

mod platform {
    use std::path::Path;

    /// Volume serial number, where the platform exposes one cheaply.
    #[cfg(windows)]
    pub fn volume_serial(mount: &Path) -> Option<u32> {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::{GetVolumeInformationW, GetVolumePathNameW};

        let wide: Vec<u16> = mount
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        unsafe {
            let mut root = [0u16; 260];
            if GetVolumePathNameW(wide.as_ptr(), root.as_mut_ptr(), root.len() as u32) == 0 {
                return None;
            }
            let mut serial = 0u32;
            let ok = GetVolumeInformationW(
                root.as_ptr(),
                std::ptr::null_mut(),
                0,
                &mut serial,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            );
            if ok == 0 {
                None
            } else {
                Some(serial)
            }
        }
    }

    #[cfg(not(windows))]
    pub fn volume_serial(_mount: &Path) -> Option<u32> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn detector_with_root(root: &Path) -> (VolumeDetector, Arc<Mutex<LocalStore>>) {
        let store = Arc::new(Mutex::new(
            LocalStore::open(root.join("state.json")).expect("Failed to open store"),
        ));
        let detector = VolumeDetector::new(
            vec![root.join("mnt")],
            vec!["mp4".to_string(), "mov".to_string()],
            Arc::clone(&store),
        )
        .expect("Failed to build detector");
        (detector, store)
    }

    fn make_card(root: &Path, name: &str, clips: &[(&str, usize)]) -> PathBuf {
        let mount = root.join("mnt").join(name);
        let dcim = mount.join("DCIM").join("100CANON");
        fs::create_dir_all(&dcim).expect("Failed to create DCIM");
        for (clip, size) in clips {
            let mut file = File::create(dcim.join(clip)).expect("Failed to create clip");
            file.write_all(&vec![0u8; *size]).expect("Failed to write clip");
        }
        mount
    }

    #[test]
    fn test_sd_card_detected_and_removed() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, _store) = detector_with_root(dir.path());

        let mount = make_card(dir.path(), "CARD_A", &[("clip1.mp4", 64), ("clip2.mov", 32)]);

        let events = detector.scan(VolumeKind::Sd);
        assert_eq!(events.len(), 1);
        let volume = match &events[0] {
            VolumeEvent::Inserted(v) => v.clone(),
            other => panic!("expected insert, got {:?}", other),
        };
        assert_eq!(volume.kind, VolumeKind::Sd);
        assert_eq!(volume.label, "CARD_A");
        assert_eq!(volume.file_count, 2);
        assert_eq!(volume.total_size_bytes, 96);

        // Unchanged card: no new events.
        assert!(detector.scan(VolumeKind::Sd).is_empty());

        fs::remove_dir_all(&mount).expect("Failed to unmount card");
        let events = detector.scan(VolumeKind::Sd);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], VolumeEvent::Removed(v) if v.label == "CARD_A"));
    }

    #[test]
    fn test_hardware_id_is_stable() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, _store) = detector_with_root(dir.path());
        let mount = dir.path().join("mnt/CARD_A");

        let first = detector.hardware_id(&mount);
        let second = detector.hardware_id(&mount);
        assert_eq!(first, second);
        assert_ne!(first, detector.hardware_id(&dir.path().join("mnt/CARD_B")));
    }

    #[test]
    fn test_marker_file_classifies_backup_disk() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, store) = detector_with_root(dir.path());

        let mount = dir.path().join("mnt").join("BACKUP_1");
        fs::create_dir_all(&mount).expect("Failed to create mount");

        let registration = detector
            .register_backup_disk(&mount, "Backup disk 1")
            .expect("Failed to register disk");
        assert!(mount.join(MARKER_FILE_NAME).exists());
        assert!(store.lock().is_registered_disk(&registration.disk_id));

        let events = detector.scan(VolumeKind::Backup);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], VolumeEvent::Inserted(v) if v.kind == VolumeKind::Backup));
    }

    #[test]
    fn test_marker_from_another_machine_is_adopted() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, store) = detector_with_root(dir.path());

        // Simulate a disk registered elsewhere: marker exists, local store
        // has never heard of it.
        let mount = dir.path().join("mnt").join("ROAMING");
        fs::create_dir_all(&mount).expect("Failed to create mount");
        let foreign = BackupDiskRegistration {
            disk_id: "vsn-cafebabe".to_string(),
            name: "Roaming backup".to_string(),
            registered_at: Utc::now(),
        };
        fs::write(
            mount.join(MARKER_FILE_NAME),
            serde_json::to_string(&foreign).unwrap(),
        )
        .expect("Failed to write marker");

        let events = detector.scan(VolumeKind::Backup);
        assert_eq!(events.len(), 1);
        assert!(store.lock().is_registered_disk("vsn-cafebabe"));
    }

    #[test]
    fn test_backup_disk_with_dcim_stays_backup() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, _store) = detector_with_root(dir.path());

        let mount = make_card(dir.path(), "AMBIGUOUS", &[("clip.mp4", 16)]);
        detector
            .register_backup_disk(&mount, "Backup with stray DCIM")
            .expect("Failed to register disk");

        assert!(detector.scan(VolumeKind::Sd).is_empty());
        assert_eq!(detector.scan(VolumeKind::Backup).len(), 1);
    }

    #[test]
    fn test_missing_mount_root_is_quiet() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let (detector, _store) = detector_with_root(dir.path());
        // mnt/ was never created; enumeration errors must not propagate.
        assert!(detector.scan(VolumeKind::Sd).is_empty());
    }

    #[test]
    fn test_enumerate_copy_sources() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let mount = make_card(dir.path(), "CARD_B", &[("a.mp4", 10), ("b.mov", 20)]);
        // A non-video file must be ignored.
        fs::write(mount.join("DCIM/100CANON/index.txt"), b"not video")
            .expect("Failed to write extra file");

        let engine = ChecksumEngine::default();
        let (ops, count, total) = enumerate_copy_sources(
            &mount,
            "fp-abc",
            &["mp4".to_string(), "mov".to_string()],
            &engine,
        );
        assert_eq!(count, 2);
        assert_eq!(total, 30);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.source_device == "fp-abc"));
    }
}
