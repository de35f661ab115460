#![warn(rust_2018_idioms)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use warren_messaging::{AllowAll, Broker, BrokerConfig};
use warren_storage::{FileKv, KvStore, MemoryKv};

/// An AMQP 0-9-1 broker core.
#[derive(Parser)]
struct Args {
    /// File backing durable state. Without it, durable entities only live
    /// as long as the process.
    #[clap(short, long)]
    store: Option<PathBuf>,
    /// Vhosts to create at startup.
    #[clap(long, default_value = "/")]
    vhost: Vec<String>,
    /// Grace period in milliseconds before an auto-delete queue is removed.
    #[clap(long, default_value_t = 100)]
    auto_delete_grace_ms: u64,
    /// The log level of the application. Overwrites the `RUST_LOG` env var.
    #[clap(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing(&args);

    let kv: Arc<dyn KvStore> = match &args.store {
        Some(path) => {
            info!(path = %path.display(), "Opening file-backed store");
            Arc::new(FileKv::open(path).context("failed to open the store file")?)
        }
        None => {
            info!("No store file configured, durable state is process-local");
            Arc::new(MemoryKv::new())
        }
    };

    let config = BrokerConfig {
        vhosts: args.vhost.clone(),
        auto_delete_grace: Duration::from_millis(args.auto_delete_grace_ms),
        ..BrokerConfig::default()
    };

    let broker = Broker::new(config, kv, Arc::new(AllowAll)).context("failed to start broker")?;
    info!("Broker core is ready; a transport collaborator can now drive it");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for the shutdown signal")?;

    broker.shutdown().await;
    Ok(())
}

fn setup_tracing(args: &Args) {
    const DEFAULT_LOG: &str = "info";

    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG.to_owned());

    tracing_subscriber::fmt()
        .with_level(true)
        .with_timer(tracing_subscriber::fmt::time::time())
        .with_ansi(true)
        .with_thread_names(true)
        .with_env_filter(&log_filter)
        .init();

    info!(%log_filter, "Using log filter level");
}
