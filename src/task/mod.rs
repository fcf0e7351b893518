pub mod executor;
pub mod scheduler;
pub mod stream;
pub mod types;

pub use executor::TaskExecutor;
pub use scheduler::{TaskQueue, TaskScheduler};
pub use stream::NumberStream;
pub use types::{AtomicTask, TaskHandle, TaskKind, TaskRegistry, TaskStatus};

use crate::config::ProberConfig;
use crate::db::TaskStore;
use crate::proxy::{FetcherHandle, ShareBus, WorkerRegistry};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a scheduler and its executors share: configuration, the store,
/// the process-wide proxy collaborators, the task registry, and the base
/// directory all runtime files live under.
pub struct TaskContext {
    pub config: Arc<ProberConfig>,
    pub store: Arc<dyn TaskStore>,
    pub fetcher: FetcherHandle,
    pub bus: ShareBus,
    pub worker_registry: Arc<WorkerRegistry>,
    pub tasks: TaskRegistry,
    pub work_dir: PathBuf,
}
