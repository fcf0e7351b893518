#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use numprobe::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "numprobe", about = "Phone-number registration prober")]
struct Cli {
    /// Path to the proxy/prober config file
    #[arg(short, long, default_value = "proxy_config.json")]
    config: PathBuf,

    /// Directory for runtime files (sinks, checkpoints, proxy caches)
    #[arg(short, long, default_value = ".")]
    work_dir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let worker_threads = server::runtime::worker_thread_count();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        work_dir: cli.work_dir,
    }))
}
