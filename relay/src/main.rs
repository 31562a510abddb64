#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod clusters;
mod config;
mod registry_file;
mod shutdown;

use clap::Parser;
use rly_cdc::{CdcConsumer, ConsumerDeps, ConsumerRegistry, RefreshOutcome, TabletLeadership};
use rly_metrics::LogFormat;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use clusters::InProcessClusters;
use registry_file::RegistryFile;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Relay - cross-cluster CDC replication consumer")]
#[command(version)]
pub struct Args {
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Consumer registry file (TOML or JSON), re-read on change
    #[arg(short, long)]
    registry: Option<PathBuf>,

    #[arg(short, long)]
    metrics: Option<SocketAddr>,

    /// Masters of the local cluster (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    local_masters: Vec<String>,

    /// "text" or "json"
    #[arg(long)]
    log_format: Option<String>,

    /// Feed synthetic writes into every mapped producer tablet
    #[arg(long)]
    demo: bool,

    #[arg(long, value_name = "PATH")]
    gen_config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    if let Some(path) = &args.gen_config {
        if let Err(e) = generate_config(path) {
            eprintln!("Failed to generate config: {}", e);
            std::process::exit(1);
        }
        println!("Generated default config at: {}", path.display());
        return;
    }

    let config = match &args.config {
        Some(path) => match config::Config::from_file(path) {
            Ok(mut c) => {
                c.apply_args(&args);
                c
            },
            Err(e) => {
                eprintln!("Failed to load config file {}: {}", path.display(), e);
                std::process::exit(1);
            },
        },
        None => config::Config::from_args(&args),
    };

    let log_format = config.log_format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{e}, falling back to text");
        LogFormat::Text
    });
    if let Err(e) = rly_metrics::init_tracing(log_format, "info,relay=debug") {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    info!(target: "relay", "Relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        target: "relay",
        local_masters = ?config.local_master_addrs,
        metrics = %config.metrics_addr,
        registry = ?config.registry.path,
        demo = config.demo.enabled,
        "Starting relay"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: "relay", error = %e, "Failed to build runtime");
            std::process::exit(1);
        },
    };

    let mut clusters = InProcessClusters::new(&config.local_master_addrs);
    let deps = ConsumerDeps::new(
        clusters.factory(),
        leadership(&config.leadership.tablets),
        config.local_master_addrs.clone(),
    );

    let consumer = match CdcConsumer::create(config.consumer_config(), deps) {
        Ok(consumer) => consumer,
        Err(e) => {
            error!(target: "relay", error = %e, "Failed to create CDC consumer");
            std::process::exit(1);
        },
    };

    runtime.block_on(async {
        if let Err(e) = rly_metrics::init_prometheus_exporter(config.metrics_addr) {
            error!(target: "relay", error = %e, "Failed to initialize metrics exporter");
            std::process::exit(1);
        }
        info!(
            target: "relay",
            addr = %config.metrics_addr,
            "Prometheus metrics exporter started"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut metrics_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = interval.tick() => rly_metrics::export_to_prometheus(),
                    _ = metrics_shutdown.changed() => break,
                }
            }
        });

        let signal = tokio::spawn(shutdown::wait_for_signal(shutdown_tx));

        tokio::select! {
            result = signal => {
                match result {
                    Ok(Ok(())) => info!(target: "relay", "Shutdown signal received"),
                    Ok(Err(e)) => error!(target: "relay", error = %e, "Failed to install signal handlers"),
                    Err(e) => error!(target: "relay", error = %e, "Signal task panicked"),
                }
            }
            () = run(&config, &mut clusters, &consumer, shutdown_rx) => {}
        }
    });

    let started = Instant::now();
    consumer.shutdown();
    shutdown::log_stopped(started.elapsed(), config.consumer_config().shutdown_timeout);

    drop(runtime);
    info!(target: "relay", "Relay shutdown complete");
}

/// Deliver registry file changes to the consumer and, when enabled, feed the
/// producers synthetic writes. Runs until shutdown is requested.
async fn run(
    config: &config::Config,
    clusters: &mut InProcessClusters,
    consumer: &CdcConsumer,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut registry_file = config.registry.path.as_ref().map(RegistryFile::new);
    if registry_file.is_none() {
        warn!(
            target: "relay",
            "No registry file configured, the consumer stays idle"
        );
    }

    let mut current: Option<ConsumerRegistry> = None;
    let mut reload = tokio::time::interval(config.reload_interval());
    let mut demo = tokio::time::interval(Duration::from_millis(config.demo.interval_ms.max(1)));

    while !shutdown::is_shutdown_requested() {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = reload.tick() => {
                let Some(file) = registry_file.as_mut() else {
                    continue;
                };
                if let Some((registry, version)) = file.poll() {
                    clusters.sync_registry(&registry);
                    let outcome = consumer.refresh_with_new_registry_from_master(Some(&registry), version);
                    info!(
                        target: "relay",
                        path = %file.path().display(),
                        version = file.version(),
                        outcome = ?outcome,
                        "Registry file delivered"
                    );
                    match outcome {
                        RefreshOutcome::Applied { .. } => current = Some(registry),
                        RefreshOutcome::Disabled { .. } => current = None,
                        RefreshOutcome::Stale { .. } => {},
                    }
                }
            }
            _ = demo.tick(), if config.demo.enabled => {
                if let Some(registry) = &current {
                    let appended = clusters.write_demo_records(registry, config.demo.records_per_tick);
                    debug!(
                        target: "relay",
                        appended,
                        pollers = consumer.list_active_poller_tablet_ids().len(),
                        local_batches = clusters.local().write_batches(),
                        "Demo writes appended"
                    );
                }
            }
        }
    }
}

fn leadership(tablets: &[String]) -> Arc<dyn TabletLeadership> {
    let led: HashSet<String> = tablets.iter().cloned().collect();
    Arc::new(move |tablet_id: &str| led.is_empty() || led.contains(tablet_id))
}

fn generate_config(path: &Path) -> std::io::Result<()> {
    let config = config::Config::default();
    let c = &config.consumer;

    let content = format!(
        r#"# Relay Configuration File
# Generated by: relay --gen-config {}
#
# All values shown are defaults. Uncomment and modify as needed.

# =============================================================================
# Local Cluster
# =============================================================================

# Masters of the local (consumer) cluster
local_master_addrs = ["{}"]

# Address and port for Prometheus metrics endpoint
metrics_addr = "{}"

# Log output: "text" or "json"
log_format = "{}"

# =============================================================================
# Registry Source
# =============================================================================

[registry]
# TOML or JSON consumer registry; every modification is delivered as the
# next registry version
# path = "/etc/relay/registry.toml"

# How often the registry file is checked for changes (milliseconds)
reload_interval_ms = {}

# =============================================================================
# Consumer Settings
# =============================================================================

[consumer]
# Period of the loop that starts pollers for newly led tablets (milliseconds)
trigger_interval_ms = {}

# Delay between two poll cycles of one producer tablet (milliseconds)
poll_delay_ms = {}

# RPC timeout of every producer client (seconds)
rpc_timeout_secs = {}

# Worker threads shared by all pollers
worker_threads = {}

# Upper bound of records requested per fetch
max_records_per_fetch = {}

# Malformed records:
#   "skip" - log and step over the record (default)
#   "halt" - stop the tablet at the record until it is fixed upstream
bad_record_policy = "skip"

# How long shutdown waits for in-flight poller work (milliseconds)
shutdown_timeout_ms = {}

# =============================================================================
# Leadership
# =============================================================================

[leadership]
# Consumer tablets this node leads; empty means every tablet
tablets = []

# =============================================================================
# Demo Writer
# =============================================================================

[demo]
# Append synthetic writes to every mapped producer tablet
enabled = {}
interval_ms = {}
records_per_tick = {}
"#,
        path.display(),
        config.local_master_addrs.join("\", \""),
        config.metrics_addr,
        config.log_format,
        config.registry.reload_interval_ms,
        c.trigger_interval_ms,
        c.poll_delay_ms,
        c.rpc_timeout_secs,
        c.worker_threads,
        c.max_records_per_fetch,
        c.shutdown_timeout_ms,
        config.demo.enabled,
        config.demo.interval_ms,
        config.demo.records_per_tick,
    );

    std::fs::write(path, content)
}
