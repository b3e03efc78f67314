//! mng idle watcher binary.
//!
//! Launched in the background by the provider when a host is created and
//! again on every start, guarded by `logs/idle_watcher.pid`. Exits after the
//! shutdown hook has run.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mng_core::layout::DEFAULT_HOST_DIR;
use mng_core::HostLayout;
use mng_watcher::{IdleWatcher, DEFAULT_INTERVAL_SECONDS};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mng-idle-watcher")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host data root
    #[arg(long, env = "MNG_HOST_DIR", default_value = DEFAULT_HOST_DIR)]
    host_dir: PathBuf,

    /// Seconds between activity checks
    #[arg(long, env = "MNG_WATCHER_INTERVAL_SECONDS", default_value_t = DEFAULT_INTERVAL_SECONDS)]
    interval_seconds: u64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,mng_watcher=debug".into()))
        .with(fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(
        host_dir = %args.host_dir.display(),
        interval = args.interval_seconds,
        "Starting idle watcher"
    );

    let watcher = IdleWatcher::new(
        HostLayout::new(args.host_dir),
        Duration::from_secs(args.interval_seconds.max(1)),
    );

    match watcher.run().await {
        Ok(decision) => {
            tracing::info!(reason = decision.reason(), "Idle watcher finished");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, category = ?e.category(), "Shutdown hook failed");
            std::process::ExitCode::FAILURE
        }
    }
}
