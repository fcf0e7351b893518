//! Interface to the relational layer owned by the control plane. The probe
//! core only needs a handful of calls; anything that can talk SQL (or hold a
//! HashMap, for tests) can back them. Implementations serialize internally,
//! callers never hold locks across calls.

use crate::error::ProbeError;
use crate::task::types::{AtomicTask, TaskStatus};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct WebsiteRecord {
    pub id: u32,
    pub address: String,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub id: u32,
    pub name_on_disk: PathBuf,
}

pub trait TaskStore: Send + Sync {
    /// Tasks scheduled by the control plane that have not started yet,
    /// oldest first. Drained once at startup and then fed via the queue.
    fn pending_tasks(&self) -> Result<Vec<AtomicTask>, ProbeError>;

    fn website(&self, id: u32) -> Result<Option<WebsiteRecord>, ProbeError>;

    fn uploads(&self, ids: &[u32]) -> Result<Vec<UploadRecord>, ProbeError>;

    /// Record progress for a task: `(processed, ip_used, status)`.
    fn update_progress(
        &self,
        task_id: u32,
        processed: u32,
        ip_used: u64,
        status: TaskStatus,
    ) -> Result<(), ProbeError>;

    /// Record the sink filenames assigned to a running task.
    fn set_task_files(
        &self,
        task_id: u32,
        input: &str,
        ok: &str,
        ok2: &str,
        not_ok: &str,
        unknown: &str,
    ) -> Result<(), ProbeError>;

    /// Persist a stopped task row referencing its checkpoint file.
    fn save_stopped_task(&self, task: &AtomicTask) -> Result<(), ProbeError>;

    /// Persist a task that failed, for operator triage.
    fn save_erred_task(&self, task: &AtomicTask) -> Result<(), ProbeError>;
}

// ---- In-memory implementation ----

#[derive(Default)]
struct MemoryInner {
    websites: HashMap<u32, WebsiteRecord>,
    uploads: HashMap<u32, UploadRecord>,
    pending: Vec<AtomicTask>,
    progress: HashMap<u32, (u32, u64, TaskStatus)>,
    task_files: HashMap<u32, Vec<String>>,
    stopped: Vec<AtomicTask>,
    erred: Vec<AtomicTask>,
    fail_progress_writes: bool,
}

/// Store backed by process memory. Carries the full `TaskStore` contract so
/// the scheduler and executor can be exercised without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().expect("memory store poisoned")
    }

    pub fn insert_website(&self, record: WebsiteRecord) {
        self.lock().websites.insert(record.id, record);
    }

    pub fn insert_upload(&self, record: UploadRecord) {
        self.lock().uploads.insert(record.id, record);
    }

    pub fn insert_pending(&self, task: AtomicTask) {
        self.lock().pending.push(task);
    }

    pub fn progress(&self, task_id: u32) -> Option<(u32, u64, TaskStatus)> {
        self.lock().progress.get(&task_id).cloned()
    }

    pub fn stopped_tasks(&self) -> Vec<AtomicTask> {
        self.lock().stopped.clone()
    }

    pub fn erred_tasks(&self) -> Vec<AtomicTask> {
        self.lock().erred.clone()
    }

    /// Make subsequent progress writes fail, to exercise recovery paths.
    pub fn fail_progress_writes(&self, fail: bool) {
        self.lock().fail_progress_writes = fail;
    }
}

impl TaskStore for MemoryStore {
    fn pending_tasks(&self) -> Result<Vec<AtomicTask>, ProbeError> {
        Ok(std::mem::take(&mut self.lock().pending))
    }

    fn website(&self, id: u32) -> Result<Option<WebsiteRecord>, ProbeError> {
        Ok(self.lock().websites.get(&id).cloned())
    }

    fn uploads(&self, ids: &[u32]) -> Result<Vec<UploadRecord>, ProbeError> {
        let inner = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.uploads.get(id).cloned())
            .collect())
    }

    fn update_progress(
        &self,
        task_id: u32,
        processed: u32,
        ip_used: u64,
        status: TaskStatus,
    ) -> Result<(), ProbeError> {
        let mut inner = self.lock();
        if inner.fail_progress_writes {
            return Err(ProbeError::Store("progress write rejected".to_string()));
        }
        inner.progress.insert(task_id, (processed, ip_used, status));
        Ok(())
    }

    fn set_task_files(
        &self,
        task_id: u32,
        input: &str,
        ok: &str,
        ok2: &str,
        not_ok: &str,
        unknown: &str,
    ) -> Result<(), ProbeError> {
        self.lock().task_files.insert(
            task_id,
            vec![
                input.to_string(),
                ok.to_string(),
                ok2.to_string(),
                not_ok.to_string(),
                unknown.to_string(),
            ],
        );
        Ok(())
    }

    fn save_stopped_task(&self, task: &AtomicTask) -> Result<(), ProbeError> {
        self.lock().stopped.push(task.clone());
        Ok(())
    }

    fn save_erred_task(&self, task: &AtomicTask) -> Result<(), ProbeError> {
        self.lock().erred.push(task.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.insert_website(WebsiteRecord {
            id: 3,
            address: "https://user.qunar.com".to_string(),
            alias: "qunar".to_string(),
        });
        assert_eq!(store.website(3).unwrap().unwrap().alias, "qunar");
        assert!(store.website(4).unwrap().is_none());

        store
            .update_progress(9, 25, 3, TaskStatus::Ongoing)
            .unwrap();
        assert_eq!(store.progress(9), Some((25, 3, TaskStatus::Ongoing)));
    }

    #[test]
    fn test_pending_tasks_drain_once() {
        let store = MemoryStore::new();
        store.insert_pending(AtomicTask::fresh(1, 3, 0, vec![9]));
        store.insert_pending(AtomicTask::fresh(2, 3, 0, vec![9]));

        let pending = store.pending_tasks().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].task_id, 1);
        assert!(store.pending_tasks().unwrap().is_empty());
    }

    #[test]
    fn test_progress_failure_injection() {
        let store = MemoryStore::new();
        store.fail_progress_writes(true);
        assert!(store
            .update_progress(1, 1, 1, TaskStatus::Completed)
            .is_err());
    }
}
