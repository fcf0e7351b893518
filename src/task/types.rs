use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Sentinel in a resumed task's ok-filename slot meaning "no checkpoint was
/// written; rebuild the input from the upload ids".
pub const FREE_MARKER: &str = "{free}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Fresh,
    Resumed,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    NotStarted,
    Ongoing,
    Stopped,
    Erred,
    Completed,
    AutoStopped,
}

/// One unit of work as the control plane hands it over. Fresh tasks carry
/// upload ids and empty file slots; resumed tasks carry the checkpoint path
/// and the four sink paths of the earlier run.
#[derive(Debug, Clone)]
pub struct AtomicTask {
    pub kind: TaskKind,
    pub task_id: u32,
    pub website_id: u32,
    pub scans_per_ip: u32,
    pub ip_used: u64,
    pub processed: u32,
    pub total: u32,
    pub ok_count: u32,
    pub not_ok_count: u32,
    pub unknown_count: u32,
    pub input_filename: String,
    pub ok_filename: String,
    pub ok2_filename: String,
    pub not_ok_filename: String,
    pub unknown_filename: String,
    pub website_address: String,
    pub number_ids: Vec<u32>,
}

impl AtomicTask {
    pub fn fresh(task_id: u32, website_id: u32, scans_per_ip: u32, number_ids: Vec<u32>) -> Self {
        Self {
            kind: TaskKind::Fresh,
            task_id,
            website_id,
            scans_per_ip,
            ip_used: 0,
            processed: 0,
            total: 0,
            ok_count: 0,
            not_ok_count: 0,
            unknown_count: 0,
            input_filename: String::new(),
            ok_filename: String::new(),
            ok2_filename: String::new(),
            not_ok_filename: String::new(),
            unknown_filename: String::new(),
            website_address: String::new(),
            number_ids,
        }
    }

    /// A resumed task that never checkpointed: input slot holds the original
    /// upload ids, the ok slot holds the `{free}` marker.
    pub fn is_free_resume(&self) -> bool {
        self.ok_filename == FREE_MARKER
    }
}

/// Sink file paths of a running task. Empty paths mean "not yet assigned"
/// (fresh tasks get theirs when the executor opens the files).
#[derive(Debug, Clone, Default)]
pub struct SinkPaths {
    pub ok: PathBuf,
    pub ok2: PathBuf,
    pub not_ok: PathBuf,
    pub unknown: PathBuf,
}

impl SinkPaths {
    pub fn is_assigned(&self) -> bool {
        !self.ok.as_os_str().is_empty()
    }
}

/// Live mirror of one task, shared between the executor, its workers, and
/// the control plane (stop requests, progress queries).
pub struct TaskHandle {
    pub task_id: u32,
    pub website_id: u32,
    pub scans_per_ip: u32,
    total: AtomicU32,
    processed: AtomicU32,
    ok_count: AtomicU32,
    not_ok_count: AtomicU32,
    unknown_count: AtomicU32,
    ip_used: AtomicU64,
    status: Mutex<TaskStatus>,
    stopped: AtomicBool,
    saving_state: AtomicBool,
    cancel: CancellationToken,
    files: Mutex<SinkPaths>,
}

impl TaskHandle {
    pub fn new(task_id: u32, website_id: u32, scans_per_ip: u32) -> Self {
        Self {
            task_id,
            website_id,
            scans_per_ip,
            total: AtomicU32::new(0),
            processed: AtomicU32::new(0),
            ok_count: AtomicU32::new(0),
            not_ok_count: AtomicU32::new(0),
            unknown_count: AtomicU32::new(0),
            ip_used: AtomicU64::new(0),
            status: Mutex::new(TaskStatus::NotStarted),
            stopped: AtomicBool::new(false),
            saving_state: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            files: Mutex::new(SinkPaths::default()),
        }
    }

    /// Rebuild the mirror of a previously persisted task.
    pub fn resumed(task: &AtomicTask) -> Self {
        let handle = Self::new(task.task_id, task.website_id, task.scans_per_ip);
        handle.total.store(task.total, Ordering::Relaxed);
        handle.processed.store(task.processed, Ordering::Relaxed);
        handle.ok_count.store(task.ok_count, Ordering::Relaxed);
        handle
            .not_ok_count
            .store(task.not_ok_count, Ordering::Relaxed);
        handle
            .unknown_count
            .store(task.unknown_count, Ordering::Relaxed);
        handle.ip_used.store(task.ip_used, Ordering::Relaxed);
        if !task.ok_filename.is_empty() && !task.is_free_resume() {
            *handle.files.lock().expect("files poisoned") = SinkPaths {
                ok: PathBuf::from(&task.ok_filename),
                ok2: PathBuf::from(&task.ok2_filename),
                not_ok: PathBuf::from(&task.not_ok_filename),
                unknown: PathBuf::from(&task.unknown_filename),
            };
        }
        handle
    }

    /// Take over the live counters (and sink paths) of an earlier run of the
    /// same task. Used on resume within one process, where the registry
    /// entry is fresher than the persisted row.
    pub fn adopt_counters(&self, previous: &TaskHandle) {
        self.total.store(previous.total(), Ordering::Relaxed);
        self.processed.store(previous.processed(), Ordering::Relaxed);
        let (ok, not_ok, unknown) = previous.counts();
        self.ok_count.store(ok, Ordering::Relaxed);
        self.not_ok_count.store(not_ok, Ordering::Relaxed);
        self.unknown_count.store(unknown, Ordering::Relaxed);
        self.ip_used.store(previous.ip_used(), Ordering::Relaxed);
        let paths = previous.sink_paths();
        if paths.is_assigned() {
            self.set_sink_paths(paths);
        }
    }

    // ---- Cancellation ----

    /// Cooperative stop: flips the flag, fires the token, and records the
    /// Stopped status. Workers drain within their per-operation timeouts.
    pub fn request_stop(&self, saving_state: bool) {
        self.saving_state.store(saving_state, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Relaxed);
        self.set_status(TaskStatus::Stopped);
        self.cancel.cancel();
    }

    /// Internal stop that keeps the current saving preference (runaway guard
    /// and RequestStop paths).
    pub fn force_stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    pub fn saving_state(&self) -> bool {
        self.saving_state.load(Ordering::Relaxed)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ---- Status ----

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().expect("status poisoned")
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock().expect("status poisoned") = status;
    }

    // ---- Counters ----

    pub fn total(&self) -> u32 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn set_total(&self, total: u32) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u32 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        (
            self.ok_count.load(Ordering::Relaxed),
            self.not_ok_count.load(Ordering::Relaxed),
            self.unknown_count.load(Ordering::Relaxed),
        )
    }

    /// Count one classification; returns the new processed total.
    pub fn record(&self, outcome: crate::site::Outcome) -> u32 {
        use crate::site::Outcome;
        match outcome {
            Outcome::NotRegistered => self.ok_count.fetch_add(1, Ordering::Relaxed),
            Outcome::Registered => self.not_ok_count.fetch_add(1, Ordering::Relaxed),
            Outcome::Unknown => self.unknown_count.fetch_add(1, Ordering::Relaxed),
            Outcome::RequestStop => 0,
        };
        self.processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn ip_used(&self) -> u64 {
        self.ip_used.load(Ordering::Relaxed)
    }

    pub fn set_ip_used(&self, value: u64) {
        self.ip_used.store(value, Ordering::Relaxed);
    }

    // ---- Files ----

    pub fn sink_paths(&self) -> SinkPaths {
        self.files.lock().expect("files poisoned").clone()
    }

    pub fn set_sink_paths(&self, paths: SinkPaths) {
        *self.files.lock().expect("files poisoned") = paths;
    }
}

/// Response registry: `task_id → TaskHandle`, queried by the control plane
/// and reused when a stopped task is resumed in the same process.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: Arc<DashMap<u32, Arc<TaskHandle>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, task_id: u32) -> Option<Arc<TaskHandle>> {
        self.tasks.get(&task_id).map(|entry| entry.value().clone())
    }

    pub fn insert(&self, handle: Arc<TaskHandle>) {
        self.tasks.insert(handle.task_id, handle);
    }

    pub fn remove(&self, task_id: u32) {
        self.tasks.remove(&task_id);
    }
}
