//! cairn - multi-tenant metrics relay
//!
//! Consumes metric records from a broker cluster, decodes and normalizes
//! them, and writes them in batches to one or more time-series database
//! endpoints, dead-lettering anything that cannot be written.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cairn_config::RelayConfig;
use cairn_relay::{metrics::serve_stats, Pipeline, RelayMetrics};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "cairn", about = "Relay broker metric streams to time-series databases", disable_version_flag = true)]
struct Cli {
    /// Full path to the config file
    #[arg(long, default_value = "config.yml")]
    config: PathBuf,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Enable CPU profiling
    #[arg(long)]
    cpuprofile: bool,

    /// Enable memory profiling
    #[arg(long)]
    memprofile: bool,

    /// Display version info and exit
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("Version:\t{}", VERSION);
        println!("Build Time:\t{}", option_env!("CAIRN_BUILD_TIME").unwrap_or("now"));
        println!("Build User:\t{}", option_env!("CAIRN_BUILD_USER").unwrap_or("none"));
        return Ok(());
    }

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().json().with_env_filter(filter).init();

    info!(version = VERSION, "cairn starting");
    if cli.cpuprofile || cli.memprofile {
        // the Go predecessor bundled a profiler; here profiling is the
        // job of external tooling (perf, heaptrack)
        warn!("profiling flags are accepted for compatibility only");
    }

    let config = RelayConfig::load(&cli.config).context("loading configuration")?;

    let mut registry = Registry::default();
    let metrics = Arc::new(RelayMetrics::new(&mut registry));
    let registry = Arc::new(RwLock::new(registry));

    let mut pipelines = Vec::with_capacity(config.write_paths.len());
    for path in &config.write_paths {
        pipelines.push(Pipeline::spawn(&config, path, metrics.clone()));
    }

    let queues = pipelines.iter().map(Pipeline::queue_depths).collect();
    let stats_address = config.stats_listen_address.clone();
    let stats_port = config.stats_listen_port;
    let stats_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_stats(&stats_address, stats_port, stats_metrics, registry, queues).await
        {
            error!(error = %e, "could not run stats listener");
            std::process::exit(1);
        }
    });

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let caught = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    error!(signal = caught, "caught signal, terminating");

    for pipeline in pipelines {
        pipeline.shutdown().await;
    }
    info!("queues flushed, exiting");
    Ok(())
}
