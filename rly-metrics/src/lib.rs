#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod latency;
mod logging;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

pub use latency::{LATENCY_APPLY, LATENCY_FETCH, LatencyHistogram, LatencySnapshot, LatencyTimer};
pub use logging::{LogFormat, init_tracing};

// Registry
pub static REGISTRY_REFRESHES: AtomicU64 = AtomicU64::new(0);
pub static REGISTRY_STALE_REFRESHES: AtomicU64 = AtomicU64::new(0);
pub static REGISTRY_CORRUPT_ENTRIES: AtomicU64 = AtomicU64::new(0);
pub static REGISTRY_VERSION: AtomicU64 = AtomicU64::new(0);

// Pollers
pub static POLLERS_ACTIVE: AtomicU64 = AtomicU64::new(0);
pub static POLLERS_STARTED: AtomicU64 = AtomicU64::new(0);
pub static POLLERS_STOPPED: AtomicU64 = AtomicU64::new(0);

// Record flow
pub static RECORDS_FETCHED: AtomicU64 = AtomicU64::new(0);
pub static RECORDS_APPLIED: AtomicU64 = AtomicU64::new(0);
pub static RECORDS_SKIPPED: AtomicU64 = AtomicU64::new(0);

// Errors
pub static FETCH_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static APPLY_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static SCHEMA_MISMATCHES: AtomicU64 = AtomicU64::new(0);
pub static CONNECT_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static CONFIGURATION_ERRORS: AtomicU64 = AtomicU64::new(0);

// Remote clients
pub static REMOTE_CLIENTS_ACTIVE: AtomicU64 = AtomicU64::new(0);
pub static REMOTE_CLIENTS_CREATED: AtomicU64 = AtomicU64::new(0);
pub static REMOTE_CLIENTS_SHUTDOWN: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn increment_registry_refreshes() {
    REGISTRY_REFRESHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_registry_stale_refreshes() {
    REGISTRY_STALE_REFRESHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_registry_corrupt_entries() {
    REGISTRY_CORRUPT_ENTRIES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn set_registry_version(version: i32) {
    REGISTRY_VERSION.store(u64::try_from(version).unwrap_or(0), Ordering::Relaxed);
}

#[inline]
pub fn poller_started() {
    POLLERS_STARTED.fetch_add(1, Ordering::Relaxed);
    POLLERS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn poller_stopped() {
    POLLERS_STOPPED.fetch_add(1, Ordering::Relaxed);
    POLLERS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_records_fetched(count: u64) {
    RECORDS_FETCHED.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_records_applied(count: u64) {
    RECORDS_APPLIED.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_records_skipped(count: u64) {
    RECORDS_SKIPPED.fetch_add(count, Ordering::Relaxed);
}

#[inline]
pub fn increment_fetch_errors() {
    FETCH_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_apply_errors() {
    APPLY_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_schema_mismatches() {
    SCHEMA_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_connect_errors() {
    CONNECT_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn increment_configuration_errors() {
    CONFIGURATION_ERRORS.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn remote_client_created() {
    REMOTE_CLIENTS_CREATED.fetch_add(1, Ordering::Relaxed);
    REMOTE_CLIENTS_ACTIVE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn remote_client_shutdown() {
    REMOTE_CLIENTS_SHUTDOWN.fetch_add(1, Ordering::Relaxed);
    REMOTE_CLIENTS_ACTIVE.fetch_sub(1, Ordering::Relaxed);
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub registry_refreshes: u64,
    pub registry_stale_refreshes: u64,
    pub registry_corrupt_entries: u64,
    pub registry_version: u64,
    pub pollers_active: u64,
    pub pollers_started: u64,
    pub pollers_stopped: u64,
    pub records_fetched: u64,
    pub records_applied: u64,
    pub records_skipped: u64,
    pub fetch_errors: u64,
    pub apply_errors: u64,
    pub schema_mismatches: u64,
    pub connect_errors: u64,
    pub configuration_errors: u64,
    pub remote_clients_active: u64,
    pub remote_clients_created: u64,
    pub remote_clients_shutdown: u64,
    pub fetch_latency: LatencySnapshot,
    pub apply_latency: LatencySnapshot,
}

impl MetricsSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            registry_refreshes: REGISTRY_REFRESHES.load(Ordering::Relaxed),
            registry_stale_refreshes: REGISTRY_STALE_REFRESHES.load(Ordering::Relaxed),
            registry_corrupt_entries: REGISTRY_CORRUPT_ENTRIES.load(Ordering::Relaxed),
            registry_version: REGISTRY_VERSION.load(Ordering::Relaxed),
            pollers_active: POLLERS_ACTIVE.load(Ordering::Relaxed),
            pollers_started: POLLERS_STARTED.load(Ordering::Relaxed),
            pollers_stopped: POLLERS_STOPPED.load(Ordering::Relaxed),
            records_fetched: RECORDS_FETCHED.load(Ordering::Relaxed),
            records_applied: RECORDS_APPLIED.load(Ordering::Relaxed),
            records_skipped: RECORDS_SKIPPED.load(Ordering::Relaxed),
            fetch_errors: FETCH_ERRORS.load(Ordering::Relaxed),
            apply_errors: APPLY_ERRORS.load(Ordering::Relaxed),
            schema_mismatches: SCHEMA_MISMATCHES.load(Ordering::Relaxed),
            connect_errors: CONNECT_ERRORS.load(Ordering::Relaxed),
            configuration_errors: CONFIGURATION_ERRORS.load(Ordering::Relaxed),
            remote_clients_active: REMOTE_CLIENTS_ACTIVE.load(Ordering::Relaxed),
            remote_clients_created: REMOTE_CLIENTS_CREATED.load(Ordering::Relaxed),
            remote_clients_shutdown: REMOTE_CLIENTS_SHUTDOWN.load(Ordering::Relaxed),
            fetch_latency: LATENCY_FETCH.snapshot(),
            apply_latency: LATENCY_APPLY.snapshot(),
        }
    }
}

pub fn init_prometheus_exporter(
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    metrics::describe_counter!(
        "relay_registry_refreshes_total",
        "Registry snapshots applied"
    );
    metrics::describe_counter!(
        "relay_registry_stale_refreshes_total",
        "Registry snapshots ignored because their version was not newer"
    );
    metrics::describe_counter!(
        "relay_registry_corrupt_entries_total",
        "Registry stream entries skipped as malformed"
    );
    metrics::describe_gauge!("relay_registry_version", "Currently applied registry version");

    metrics::describe_gauge!("relay_pollers_active", "Tablet pollers currently running");
    metrics::describe_counter!("relay_pollers_started_total", "Tablet pollers started");
    metrics::describe_counter!("relay_pollers_stopped_total", "Tablet pollers stopped");

    metrics::describe_counter!(
        "relay_records_fetched_total",
        "Change records fetched from producers"
    );
    metrics::describe_counter!(
        "relay_records_applied_total",
        "Change records applied to local tablets"
    );
    metrics::describe_counter!(
        "relay_records_skipped_total",
        "Malformed change records skipped"
    );

    metrics::describe_counter!("relay_fetch_errors_total", "Failed get_changes calls");
    metrics::describe_counter!("relay_apply_errors_total", "Failed batch applies");
    metrics::describe_counter!(
        "relay_schema_mismatches_total",
        "Applies rejected for an unmapped producer schema version"
    );
    metrics::describe_counter!(
        "relay_connect_errors_total",
        "Producer client construction failures"
    );
    metrics::describe_counter!(
        "relay_configuration_errors_total",
        "Client requests for clusters without known endpoints"
    );

    metrics::describe_gauge!(
        "relay_remote_clients_active",
        "Open clients to producer clusters"
    );
    metrics::describe_counter!(
        "relay_remote_clients_created_total",
        "Producer clients created"
    );
    metrics::describe_counter!(
        "relay_remote_clients_shutdown_total",
        "Producer clients shut down"
    );

    metrics::describe_gauge!(
        "relay_fetch_latency_p99_us",
        "Approximate p99 get_changes round trip in microseconds"
    );
    metrics::describe_gauge!(
        "relay_apply_latency_p99_us",
        "Approximate p99 batch apply latency in microseconds"
    );

    Ok(())
}

/// Publish the current atomic counters to the Prometheus recorder.
#[allow(clippy::cast_precision_loss)]
pub fn export_to_prometheus() {
    let s = MetricsSnapshot::capture();

    metrics::counter!("relay_registry_refreshes_total").absolute(s.registry_refreshes);
    metrics::counter!("relay_registry_stale_refreshes_total").absolute(s.registry_stale_refreshes);
    metrics::counter!("relay_registry_corrupt_entries_total").absolute(s.registry_corrupt_entries);
    metrics::gauge!("relay_registry_version").set(s.registry_version as f64);

    metrics::gauge!("relay_pollers_active").set(s.pollers_active as f64);
    metrics::counter!("relay_pollers_started_total").absolute(s.pollers_started);
    metrics::counter!("relay_pollers_stopped_total").absolute(s.pollers_stopped);

    metrics::counter!("relay_records_fetched_total").absolute(s.records_fetched);
    metrics::counter!("relay_records_applied_total").absolute(s.records_applied);
    metrics::counter!("relay_records_skipped_total").absolute(s.records_skipped);

    metrics::counter!("relay_fetch_errors_total").absolute(s.fetch_errors);
    metrics::counter!("relay_apply_errors_total").absolute(s.apply_errors);
    metrics::counter!("relay_schema_mismatches_total").absolute(s.schema_mismatches);
    metrics::counter!("relay_connect_errors_total").absolute(s.connect_errors);
    metrics::counter!("relay_configuration_errors_total").absolute(s.configuration_errors);

    metrics::gauge!("relay_remote_clients_active").set(s.remote_clients_active as f64);
    metrics::counter!("relay_remote_clients_created_total").absolute(s.remote_clients_created);
    metrics::counter!("relay_remote_clients_shutdown_total").absolute(s.remote_clients_shutdown);

    metrics::gauge!("relay_fetch_latency_p99_us").set(s.fetch_latency.percentile(99.0) as f64);
    metrics::gauge!("relay_apply_latency_p99_us").set(s.apply_latency.percentile(99.0) as f64);
}
