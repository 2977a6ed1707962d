//! Watched-folder polling and copy correlation.
//!
//! Each poll diffs a directory listing against the last known state:
//! - New files are held in a settle window until their size stops moving,
//!   then matched against registered copy sources (size AND checksum) to
//!   decide between `Copied` and a plain `Added`.
//! - A disappearance and an appearance with the same bytes in the same
//!   folder within the settle window is reported as a `Renamed`, which is
//!   how the metadata-correction workflow is told apart from remove+add.
//! - In-place content changes recompute the checksum and emit `Changed`.
//!
//! Copy-source registrations expire after a TTL to bound memory and avoid
//! false matches against stale sources. Per-file I/O errors skip that file
//! only; a poll never fails as a whole.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::checksum::ChecksumEngine;
use crate::config::WatchFolder;
use crate::events::FileEvent;
use crate::model::{CopyOperation, TrackedFile};
use crate::volume::has_allowed_extension;

/// Size and mtime snapshot of one on-disk file.
struct FileMeta {
    size: u64,
    modified: DateTime<Utc>,
}

/// A new file waiting for its size to stop moving.
struct Settling {
    size: u64,
    stable_polls: u32,
}

/// A tracked file that disappeared; held briefly so a rename partner can
/// claim it before a `Removed` goes out.
struct PendingRemoval {
    file: TrackedFile,
    polls_left: u32,
}

/// Polls configured folders and correlates arrivals with copy sources.
pub struct FileWatcher {
    folders: Vec<WatchFolder>,
    extensions: Vec<String>,
    settle_polls: u32,
    registration_ttl: Duration,
    engine: ChecksumEngine,
    tracked: Mutex<HashMap<PathBuf, TrackedFile>>,
    settling: Mutex<HashMap<PathBuf, Settling>>,
    pending_removals: Mutex<HashMap<PathBuf, PendingRemoval>>,
    registrations: Mutex<Vec<CopyOperation>>,
}

impl FileWatcher {
    pub fn new(
        folders: Vec<WatchFolder>,
        extensions: Vec<String>,
        settle_polls: u32,
        registration_ttl: Duration,
        engine: ChecksumEngine,
    ) -> Self {
        FileWatcher {
            folders,
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            settle_polls: settle_polls.max(1),
            registration_ttl,
            engine,
            tracked: Mutex::new(HashMap::new()),
            settling: Mutex::new(HashMap::new()),
            pending_removals: Mutex::new(HashMap::new()),
            registrations: Mutex::new(Vec::new()),
        }
    }

    /// Register an expected copy source. Arrivals matching its size and
    /// checksum within the TTL are reported as `Copied` instead of `Added`.
    pub fn register_copy_source(&self, operation: CopyOperation) {
        self.registrations.lock().push(operation);
    }

    pub fn register_copy_sources(&self, operations: Vec<CopyOperation>) {
        self.registrations.lock().extend(operations);
    }

    /// Number of live (unexpired, unconsumed) registrations.
    pub fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    /// Run one poll over every watched folder.
    pub fn poll(&self) -> Vec<FileEvent> {
        self.expire_registrations(Utc::now());

        let mut events = Vec::new();
        for folder in &self.folders {
            self.poll_folder(folder, &mut events);
        }
        self.age_pending_removals(&mut events);
        events
    }

    /// Drop registrations older than the TTL.
    pub fn expire_registrations(&self, now: DateTime<Utc>) {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|op| !op.is_expired(now, self.registration_ttl));
        let dropped = before - registrations.len();
        if dropped > 0 {
            debug!(dropped, "expired stale copy registrations");
        }
    }

    fn poll_folder(&self, folder: &WatchFolder, events: &mut Vec<FileEvent>) {
        let current = self.list_folder(folder);

        let mut tracked = self.tracked.lock();
        let mut settling = self.settling.lock();
        let mut pending_removals = self.pending_removals.lock();

        // Tracked files that vanished wait out the settle window before a
        // Removed is emitted, in case they come back under a new name.
        let gone: Vec<PathBuf> = tracked
            .keys()
            .filter(|p| p.starts_with(&folder.path) && !current.contains_key(*p))
            .cloned()
            .collect();
        for path in gone {
            if let Some(file) = tracked.remove(&path) {
                pending_removals.insert(
                    path,
                    PendingRemoval {
                        file,
                        polls_left: self.settle_polls + 1,
                    },
                );
            }
        }

        // Settling entries whose file vanished again are forgotten.
        settling.retain(|path, _| !path.starts_with(&folder.path) || current.contains_key(path));

        for (path, meta) in &current {
            if tracked.contains_key(path) {
                continue;
            }

            let stable = {
                let entry = settling.entry(path.clone()).or_insert(Settling {
                    size: meta.size,
                    stable_polls: 0,
                });
                if entry.size == meta.size {
                    entry.stable_polls += 1;
                } else {
                    entry.size = meta.size;
                    entry.stable_polls = 1;
                }
                entry.stable_polls >= self.settle_polls
            };
            if !stable {
                continue;
            }

            let checksum = match self.engine.checksum_file(path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    // Keep it settling; the next poll retries.
                    warn!(path = %path.display(), error = %e, "cannot hash new file yet");
                    continue;
                }
            };
            settling.remove(path);

            let file = TrackedFile {
                name: file_name_of(path),
                folder: path.parent().unwrap_or(&folder.path).to_path_buf(),
                folder_kind: folder.kind,
                size: meta.size,
                checksum,
                created_at: Utc::now(),
                modified_at: meta.modified,
            };

            // Rename: same folder, same bytes, within the settle window.
            let partner = pending_removals
                .iter()
                .find(|(_, pr)| {
                    pr.file.folder == file.folder
                        && pr.file.size == file.size
                        && pr.file.checksum == file.checksum
                })
                .map(|(p, _)| p.clone());
            if let Some(old_path) = partner {
                if let Some(previous) = pending_removals.remove(&old_path) {
                    events.push(FileEvent::Renamed {
                        old_name: previous.file.name,
                        new_name: file.name.clone(),
                        file: file.clone(),
                    });
                    tracked.insert(path.clone(), file);
                    continue;
                }
            }

            match self.take_matching_registration(file.size, &file.checksum) {
                Some(operation) => events.push(FileEvent::Copied {
                    file: file.clone(),
                    source_path: operation.source_path,
                    source_device: operation.source_device,
                }),
                None => events.push(FileEvent::Added(file.clone())),
            }
            tracked.insert(path.clone(), file);
        }

        // In-place changes on files we already track.
        for (path, meta) in &current {
            let existing = match tracked.get(path) {
                Some(existing) => existing.clone(),
                None => continue,
            };
            if existing.size == meta.size && existing.modified_at == meta.modified {
                continue;
            }
            let checksum = match self.engine.checksum_file(path) {
                Ok(checksum) => checksum,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot rehash changed file");
                    continue;
                }
            };
            let mut updated = existing.clone();
            updated.size = meta.size;
            updated.modified_at = meta.modified;
            if checksum != existing.checksum {
                updated.checksum = checksum;
                events.push(FileEvent::Changed(updated.clone()));
            }
            tracked.insert(path.clone(), updated);
        }
    }

    /// Count down held removals; anything unclaimed becomes Removed.
    fn age_pending_removals(&self, events: &mut Vec<FileEvent>) {
        let mut pending = self.pending_removals.lock();
        let mut expired = Vec::new();
        for (path, pr) in pending.iter_mut() {
            pr.polls_left -= 1;
            if pr.polls_left == 0 {
                expired.push(path.clone());
            }
        }
        for path in expired {
            if let Some(pr) = pending.remove(&path) {
                events.push(FileEvent::Removed {
                    folder: pr.file.folder,
                    name: pr.file.name,
                });
            }
        }
    }

    fn take_matching_registration(
        &self,
        size: u64,
        checksum: &crate::checksum::ChecksumValue,
    ) -> Option<CopyOperation> {
        let mut registrations = self.registrations.lock();
        let index = registrations
            .iter()
            .position(|op| op.size == size && op.checksum == *checksum)?;
        Some(registrations.remove(index))
    }

    /// List the video files currently in a folder. Listing errors are
    /// logged and yield an empty map; the next poll retries.
    fn list_folder(&self, folder: &WatchFolder) -> HashMap<PathBuf, FileMeta> {
        let mut files = HashMap::new();

        if folder.recursive {
            for entry in WalkDir::new(&folder.path).into_iter() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        debug!(folder = %folder.path.display(), error = %e, "walk error");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                if !has_allowed_extension(entry.path(), &self.extensions) {
                    continue;
                }
                if let Ok(metadata) = entry.metadata() {
                    files.insert(entry.path().to_path_buf(), meta_of(&metadata));
                }
            }
        } else {
            let entries = match fs::read_dir(&folder.path) {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(folder = %folder.path.display(), error = %e, "cannot list folder");
                    return files;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() || !has_allowed_extension(&path, &self.extensions) {
                    continue;
                }
                if let Ok(metadata) = entry.metadata() {
                    files.insert(path, meta_of(&metadata));
                }
            }
        }

        files
    }
}

fn meta_of(metadata: &fs::Metadata) -> FileMeta {
    let mtime = filetime::FileTime::from_last_modification_time(metadata);
    let modified = DateTime::from_timestamp(mtime.unix_seconds(), mtime.nanoseconds())
        .unwrap_or_default();
    FileMeta {
        size: metadata.len(),
        modified,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WatchFolderKind;
    use std::io::Write;

    fn watcher_for(dir: &Path) -> FileWatcher {
        FileWatcher::new(
            vec![WatchFolder {
                path: dir.to_path_buf(),
                kind: WatchFolderKind::Ingest,
                recursive: true,
            }],
            vec!["mp4".to_string(), "mov".to_string()],
            2,
            Duration::from_secs(300),
            ChecksumEngine::default(),
        )
    }

    fn write_file(path: &Path, contents: &[u8]) {
        let mut file = fs::File::create(path).expect("Failed to create file");
        file.write_all(contents).expect("Failed to write file");
    }

    /// Poll until the watcher has seen the current state settle.
    fn settle(watcher: &FileWatcher) -> Vec<FileEvent> {
        let mut events = watcher.poll();
        events.extend(watcher.poll());
        events
    }

    #[test]
    fn test_add_waits_for_settle_window() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());

        write_file(&dir.path().join("clip.mp4"), b"new footage");

        assert!(watcher.poll().is_empty(), "first sighting must not emit");
        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FileEvent::Added(f) if f.name == "clip.mp4"));
    }

    #[test]
    fn test_growing_file_keeps_settling() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());
        let path = dir.path().join("copying.mov");

        write_file(&path, b"partial");
        assert!(watcher.poll().is_empty());

        // Still growing: the settle counter resets.
        write_file(&path, b"partial plus more");
        assert!(watcher.poll().is_empty());

        // Now stable for two polls.
        assert_eq!(watcher.poll().len(), 1);
    }

    #[test]
    fn test_registered_source_reclassifies_add_as_copied() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let card = dir.path().join("card");
        let ingest = dir.path().join("ingest");
        fs::create_dir_all(&card).expect("card dir");
        fs::create_dir_all(&ingest).expect("ingest dir");

        let contents = b"A001_C001 capture";
        let source = card.join("A001_C001.mp4");
        write_file(&source, contents);

        let watcher = watcher_for(&ingest);
        let engine = ChecksumEngine::default();
        watcher.register_copy_source(CopyOperation {
            source_path: source.clone(),
            source_device: "vsn-0badf00d".to_string(),
            size: contents.len() as u64,
            checksum: engine.checksum_file(&source).expect("hash source"),
            registered_at: Utc::now(),
        });

        write_file(&ingest.join("A001_C001.mp4"), contents);
        let events = settle(&watcher);
        assert_eq!(events.len(), 1);
        match &events[0] {
            FileEvent::Copied {
                file,
                source_path,
                source_device,
            } => {
                assert_eq!(file.name, "A001_C001.mp4");
                assert_eq!(source_path, &source);
                assert_eq!(source_device, "vsn-0badf00d");
            }
            other => panic!("expected Copied, got {:?}", other),
        }
        assert_eq!(watcher.registration_count(), 0, "match consumes the registration");

        // The same bytes arriving again have no registration left to match.
        write_file(&ingest.join("duplicate.mp4"), contents);
        let events = settle(&watcher);
        assert!(matches!(&events[0], FileEvent::Added(_)));
    }

    #[test]
    fn test_expired_registration_does_not_match() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());

        let contents = b"stale source";
        let path = dir.path().join("late.mp4");
        write_file(&path, contents);

        let engine = ChecksumEngine::default();
        watcher.register_copy_source(CopyOperation {
            source_path: PathBuf::from("/media/editor/OLD_CARD/DCIM/late.mp4"),
            source_device: "fp-dead".to_string(),
            size: contents.len() as u64,
            checksum: engine.checksum_file(&path).expect("hash"),
            registered_at: Utc::now() - chrono::Duration::seconds(600),
        });

        let events = settle(&watcher);
        assert_eq!(watcher.registration_count(), 0, "TTL drops the registration");
        assert!(matches!(&events[0], FileEvent::Added(_)));
    }

    #[test]
    fn test_rename_is_not_remove_plus_add() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());
        let original = dir.path().join("C0001.mp4");

        write_file(&original, b"clip to be renamed");
        let events = settle(&watcher);
        assert!(matches!(&events[0], FileEvent::Added(_)));

        // The metadata-correction workflow renames in place.
        let renamed = dir.path().join("220801_CAM2_C0001.mp4");
        fs::rename(&original, &renamed).expect("Failed to rename");

        let mut events = watcher.poll();
        events.extend(watcher.poll());
        events.extend(watcher.poll());
        assert_eq!(events.len(), 1, "expected only a rename, got {:?}", events);
        match &events[0] {
            FileEvent::Renamed {
                old_name, new_name, ..
            } => {
                assert_eq!(old_name, "C0001.mp4");
                assert_eq!(new_name, "220801_CAM2_C0001.mp4");
            }
            other => panic!("expected Renamed, got {:?}", other),
        }
    }

    #[test]
    fn test_removed_after_hold_window() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());
        let path = dir.path().join("gone.mp4");

        write_file(&path, b"soon deleted");
        settle(&watcher);

        fs::remove_file(&path).expect("Failed to delete");
        assert!(watcher.poll().is_empty());
        assert!(watcher.poll().is_empty());
        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FileEvent::Removed { name, .. } if name == "gone.mp4"));
    }

    #[test]
    fn test_content_change_emits_changed() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());
        let path = dir.path().join("edited.mp4");

        write_file(&path, b"before");
        settle(&watcher);

        write_file(&path, b"after the edit");
        let events = watcher.poll();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FileEvent::Changed(file) => assert_eq!(file.size, 14),
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_non_video_files_ignored() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = watcher_for(dir.path());

        write_file(&dir.path().join("notes.txt"), b"not footage");
        write_file(&dir.path().join(".DS_Store"), b"junk");
        assert!(settle(&watcher).is_empty());
    }

    #[test]
    fn test_missing_folder_is_quiet() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let watcher = FileWatcher::new(
            vec![WatchFolder {
                path: dir.path().join("never-created"),
                kind: WatchFolderKind::Ingest,
                recursive: false,
            }],
            vec!["mp4".to_string()],
            2,
            Duration::from_secs(300),
            ChecksumEngine::default(),
        );
        assert!(watcher.poll().is_empty());
    }
}
