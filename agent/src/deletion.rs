//! Server-issued retention tasks.
//!
//! A periodic two-phase pass: first replay the locally cached tasks, then
//! fetch newly issued ones, merge them (deduplicated by id) and attempt
//! them in the same pass. The server only issues tasks for closed events;
//! the agent never decides on its own that a file is safe to delete.
//!
//! A file that is already gone counts as success — the goal is "this media
//! no longer occupies the workstation", not "we performed an unlink".

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::api::DeletionOutcome;
use crate::model::{DeletionStatus, DeletionTask};
use crate::store::LocalStore;
use crate::sync::SyncGateway;

/// Summary of one processing pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionPass {
    pub attempted: usize,
    pub completed: usize,
    pub kept: usize,
}

/// Consumes server-issued deletion tasks against local media folders.
pub struct DeletionTaskProcessor {
    gateway: Arc<SyncGateway>,
    store: Arc<Mutex<LocalStore>>,
    device_id: String,
    media_dirs: Vec<PathBuf>,
}

enum Attempt {
    /// Reported to the server (or permanently failed); drop from the cache
    Done,
    /// Transient trouble; keep the task cached for the next pass
    Keep(DeletionTask),
}

impl DeletionTaskProcessor {
    pub fn new(
        gateway: Arc<SyncGateway>,
        store: Arc<Mutex<LocalStore>>,
        device_id: String,
        media_dirs: Vec<PathBuf>,
    ) -> Self {
        DeletionTaskProcessor {
            gateway,
            store,
            device_id,
            media_dirs,
        }
    }

    /// Run one two-phase pass: cached tasks first, then freshly fetched
    /// ones merged in by id.
    pub async fn run_once(&self) -> DeletionPass {
        let mut pass = DeletionPass::default();
        let mut keep = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let cached = self.store.lock().pending_deletions();
        for task in cached {
            seen.insert(task.id.clone());
            self.attempt(task, &mut pass, &mut keep).await;
        }

        match self.gateway.deletion_tasks(&self.device_id).await {
            Ok(fresh) => {
                for task in fresh {
                    if !seen.insert(task.id.clone()) {
                        continue;
                    }
                    self.attempt(task, &mut pass, &mut keep).await;
                }
            }
            Err(e) => debug!(error = %e, "deletion task fetch skipped"),
        }

        pass.kept = keep.len();
        if let Err(e) = self.store.lock().set_pending_deletions(keep) {
            warn!(error = %e, "could not persist deletion cache");
        }

        if pass.attempted > 0 {
            info!(
                attempted = pass.attempted,
                completed = pass.completed,
                kept = pass.kept,
                "deletion pass finished"
            );
        }
        pass
    }

    async fn attempt(&self, task: DeletionTask, pass: &mut DeletionPass, keep: &mut Vec<DeletionTask>) {
        pass.attempted += 1;
        match self.attempt_one(task).await {
            Attempt::Done => pass.completed += 1,
            Attempt::Keep(task) => keep.push(task),
        }
    }

    async fn attempt_one(&self, task: DeletionTask) -> Attempt {
        let outcome = match self.delete_file(&task) {
            Ok(detail) => DeletionOutcome {
                task_id: task.id.clone(),
                status: DeletionStatus::Completed,
                detail,
            },
            Err(e) => {
                // Deletion blocked locally (permissions, file busy): keep
                // the task and try again next pass.
                warn!(task_id = %task.id, error = %e, "deletion attempt failed, keeping task");
                return Attempt::Keep(task);
            }
        };

        match self.gateway.complete_deletion_task(&outcome).await {
            Ok(()) => Attempt::Done,
            Err(e) if e.is_transient() => {
                // Deleted but not reported; keep the task. Next pass finds
                // the file already gone and just re-reports.
                debug!(task_id = %task.id, "completion report deferred until connectivity returns");
                Attempt::Keep(task)
            }
            Err(e) => {
                // The server rejected the report outright; retrying the
                // same report forever helps nobody.
                warn!(task_id = %task.id, error = %e, "completion report rejected, dropping task");
                Attempt::Done
            }
        }
    }

    /// Delete the task's file, searching the recorded path first and then
    /// the configured media folders (the file may have been moved between
    /// capture and deletion). "Not found anywhere" is success.
    fn delete_file(&self, task: &DeletionTask) -> Result<Option<String>, std::io::Error> {
        for candidate in self.candidate_paths(task) {
            if !candidate.is_file() {
                continue;
            }
            std::fs::remove_file(&candidate)?;
            info!(task_id = %task.id, path = %candidate.display(), "media file deleted");
            return Ok(None);
        }
        Ok(Some("already gone".to_string()))
    }

    fn candidate_paths(&self, task: &DeletionTask) -> Vec<PathBuf> {
        let mut candidates = vec![task.file_path.clone()];
        if let Some(name) = task.file_path.file_name() {
            for dir in &self.media_dirs {
                candidates.push(dir.join(name));
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MockApi;
    use crate::api::RemoteApi;
    use std::fs;

    struct Fixture {
        api: Arc<MockApi>,
        store: Arc<Mutex<LocalStore>>,
        processor: DeletionTaskProcessor,
    }

    fn fixture(dir: &tempfile::TempDir, media_dirs: Vec<PathBuf>) -> Fixture {
        let api = Arc::new(MockApi::default());
        let store = Arc::new(Mutex::new(
            LocalStore::open(dir.path().join("state.json")).expect("Failed to open store"),
        ));
        let gateway = Arc::new(SyncGateway::new(
            Arc::clone(&api) as Arc<dyn RemoteApi>,
            Arc::clone(&store),
        ));
        let processor = DeletionTaskProcessor::new(
            gateway,
            Arc::clone(&store),
            "station-1".to_string(),
            media_dirs,
        );
        Fixture {
            api,
            store,
            processor,
        }
    }

    fn task(id: &str, path: PathBuf) -> DeletionTask {
        DeletionTask {
            id: id.to_string(),
            event_id: "event-1".to_string(),
            media_id: format!("media-{id}"),
            device_id: "station-1".to_string(),
            file_path: path,
            status: DeletionStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_fetched_task_deletes_file_and_reports() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let clip = dir.path().join("clip.mp4");
        fs::write(&clip, b"old footage").expect("Failed to write clip");

        let f = fixture(&dir, vec![]);
        f.api.tasks.lock().push(task("t1", clip.clone()));

        let pass = f.processor.run_once().await;
        assert_eq!(pass.attempted, 1);
        assert_eq!(pass.completed, 1);
        assert_eq!(pass.kept, 0);
        assert!(!clip.exists());
        assert_eq!(f.api.call_count("media_deletion.complete"), 1);
    }

    #[tokio::test]
    async fn test_already_gone_counts_as_success() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir, vec![]);
        f.api
            .tasks
            .lock()
            .push(task("t1", dir.path().join("never-existed.mp4")));

        let pass = f.processor.run_once().await;
        assert_eq!(pass.completed, 1);
        assert_eq!(pass.kept, 0);
    }

    #[tokio::test]
    async fn test_moved_file_found_via_media_dirs() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let movies = dir.path().join("Movies");
        fs::create_dir_all(&movies).expect("Failed to create media dir");
        let moved = movies.join("clip.mp4");
        fs::write(&moved, b"relocated").expect("Failed to write clip");

        let f = fixture(&dir, vec![movies]);
        // The recorded path is stale; only the media-dir candidate exists.
        f.api
            .tasks
            .lock()
            .push(task("t1", dir.path().join("ingest/clip.mp4")));

        let pass = f.processor.run_once().await;
        assert_eq!(pass.completed, 1);
        assert!(!moved.exists());
    }

    #[tokio::test]
    async fn test_offline_fetch_still_replays_cache() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let clip = dir.path().join("cached.mp4");
        fs::write(&clip, b"cached footage").expect("Failed to write clip");

        let f = fixture(&dir, vec![]);
        f.store
            .lock()
            .set_pending_deletions(vec![task("cached-1", clip.clone())])
            .expect("seed cache");

        // Network down: deletion still happens locally, but neither the
        // fetch nor the completion report goes through, so the task stays
        // cached for re-reporting.
        f.api.set_network_down(true);
        let pass = f.processor.run_once().await;
        assert!(!clip.exists());
        assert_eq!(pass.completed, 0);
        assert_eq!(pass.kept, 1);

        // Connectivity back: next pass finds the file already gone and
        // reports completion.
        f.api.set_network_down(false);
        let pass = f.processor.run_once().await;
        assert_eq!(pass.completed, 1);
        assert_eq!(pass.kept, 0);
        assert!(f.store.lock().pending_deletions().is_empty());
    }

    #[tokio::test]
    async fn test_fetched_duplicates_of_cache_are_skipped() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir, vec![]);

        let t = task("dup-1", dir.path().join("gone.mp4"));
        f.store
            .lock()
            .set_pending_deletions(vec![t.clone()])
            .expect("seed cache");
        f.api.tasks.lock().push(t);

        let pass = f.processor.run_once().await;
        assert_eq!(pass.attempted, 1, "same id must not be attempted twice");
    }

    #[tokio::test]
    async fn test_rejected_report_drops_task() {
        // A non-transient completion failure must not loop forever.
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let f = fixture(&dir, vec![]);
        f.api
            .tasks
            .lock()
            .push(task("t1", dir.path().join("gone.mp4")));
        f.api.reject("media_deletion.complete");

        let pass = f.processor.run_once().await;
        assert_eq!(pass.kept, 0);
        assert!(f.store.lock().pending_deletions().is_empty());

        // Next pass re-fetches the same task id from the server, but the
        // pass itself must not keep it cached either.
        let pass = f.processor.run_once().await;
        assert_eq!(pass.kept, 0);
    }
}
