use crate::config::ProberConfig;
use crate::db::{MemoryStore, TaskStore};
use crate::proxy::{fetcher, ShareBus, WorkerRegistry};
use crate::task::{TaskContext, TaskQueue, TaskRegistry, TaskScheduler};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub work_dir: PathBuf,
}

/// Fully wired prober: submit tasks through `queue`, watch them through
/// `tasks`. The embedding control plane holds this for the process lifetime.
pub struct Prober {
    pub queue: TaskQueue,
    pub tasks: TaskRegistry,
    pub shutdown: CancellationToken,
    scheduler: tokio::task::JoinHandle<()>,
}

impl Prober {
    /// Wire the process-wide collaborators and start the scheduler loop.
    pub fn start(
        config: ProberConfig,
        store: Arc<dyn TaskStore>,
        work_dir: PathBuf,
    ) -> Result<Self> {
        if config.requires_upgrade() {
            anyhow::bail!(
                "client_version {} is below the accepted minimum, upgrade required",
                config.client_version
            );
        }

        let shutdown = CancellationToken::new();
        let fetcher = fetcher::spawn(config.proxy.fetch_interval, shutdown.clone());
        let tasks = TaskRegistry::new();

        let context = Arc::new(TaskContext {
            config: Arc::new(config),
            store,
            fetcher,
            bus: ShareBus::new(),
            worker_registry: Arc::new(WorkerRegistry::new()),
            tasks: tasks.clone(),
            work_dir,
        });

        let (queue, scheduler) = TaskScheduler::new(context.clone(), shutdown.clone());
        let scheduler = tokio::spawn(scheduler.run());

        // Work scheduled while we were down goes first.
        match context.store.pending_tasks() {
            Ok(pending) => {
                for task in pending {
                    queue.submit(task);
                }
            }
            Err(e) => tracing::error!("server: could not enumerate pending tasks: {}", e),
        }

        Ok(Self {
            queue,
            tasks,
            shutdown,
            scheduler,
        })
    }

    /// Signal every loop to stop and wait for the scheduler to drain.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.scheduler.await {
            tracing::error!("server: scheduler task error: {}", e);
        }
    }
}

/// Prober lifecycle: init → wire → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = ProberConfig::load(&args.config_path)?;
    let metrics = crate::metrics::Metrics::install();

    // The relational store is the control plane's collaborator; standalone
    // deployments run on the in-memory one until the plane connects.
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let prober = Prober::start(config, store, args.work_dir)?;

    tracing::info!("server: prober ready, awaiting tasks");

    wait_for_shutdown().await;
    prober.shutdown.cancel();
    prober.stop().await;

    tracing::debug!("server: final metrics\n{}", metrics.render());
    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
