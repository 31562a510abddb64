//! In-process cluster used by tests and the standalone binary.
//!
//! A [`MemoryCluster`] plays both roles: it holds producer tablet logs that
//! `get_changes` reads from, and consumer tablets that `write` applies to.
//! Fault injection (fetch delays, failed fetches, failed writes, failed client
//! builds) lets callers exercise the consumer's retry paths.

use bytes::Bytes;
use futures::future::BoxFuture;
use rly_core::{ChangeRecord, HlcTimestamp, OpId, TransactionId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use crate::client::{
    ClientFactory, ClientOptions, ClusterClient, GetChangesRequest, GetChangesResponse,
    TransactionStatus, TransactionUpdate, WriteBatch, WriteColumn, WriteKind,
};
use crate::error::{ClientError, Result};

/// Value of one row version in a memory tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredValue {
    Row {
        columns: Vec<WriteColumn>,
        transaction_id: Option<TransactionId>,
    },
    Tombstone,
}

#[derive(Default)]
struct ClusterState {
    /// Producer role: (stream, tablet) -> records in log order
    logs: HashMap<(String, String), Vec<ChangeRecord>>,
    /// Consumer role: tablet -> key -> write_time -> value
    tablets: HashMap<String, BTreeMap<Bytes, BTreeMap<HlcTimestamp, StoredValue>>>,
    /// Every write batch in the order it was applied
    write_log: Vec<WriteBatch>,
    transactions: HashMap<(String, TransactionId), TransactionUpdate>,
    fetches: HashMap<String, u64>,
}

#[derive(Default)]
struct Faults {
    fetch_delay: HashMap<String, Duration>,
    fetch_failures: HashMap<String, u32>,
    write_failures: u32,
}

pub struct MemoryCluster {
    name: String,
    state: Mutex<ClusterState>,
    faults: Mutex<Faults>,
    open_clients: AtomicUsize,
}

impl MemoryCluster {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(ClusterState::default()),
            faults: Mutex::new(Faults::default()),
            open_clients: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append records to a producer tablet log, creating the tablet if needed.
    pub fn append(&self, stream_id: &str, tablet_id: &str, records: impl IntoIterator<Item = ChangeRecord>) {
        let mut state = self.state();
        state
            .logs
            .entry((stream_id.to_string(), tablet_id.to_string()))
            .or_default()
            .extend(records);
    }

    /// Number of `get_changes` calls that reached the tablet.
    pub fn fetch_count(&self, tablet_id: &str) -> u64 {
        self.state().fetches.get(tablet_id).copied().unwrap_or(0)
    }

    /// Latest visible row at `key`, `None` if absent or deleted.
    pub fn read(&self, tablet_id: &str, key: &[u8]) -> Option<Vec<WriteColumn>> {
        let state = self.state();
        let versions = state.tablets.get(tablet_id)?.get(key)?;
        match versions.values().next_back()? {
            StoredValue::Row { columns, .. } => Some(columns.clone()),
            StoredValue::Tombstone => None,
        }
    }

    /// Number of distinct versions stored for `key`.
    pub fn version_count(&self, tablet_id: &str, key: &[u8]) -> usize {
        self.state()
            .tablets
            .get(tablet_id)
            .and_then(|rows| rows.get(key))
            .map_or(0, BTreeMap::len)
    }

    /// Number of distinct keys stored in a local tablet.
    pub fn row_count(&self, tablet_id: &str) -> usize {
        self.state().tablets.get(tablet_id).map_or(0, BTreeMap::len)
    }

    /// Keys of all writes applied to `tablet_id`, in apply order.
    pub fn applied_keys(&self, tablet_id: &str) -> Vec<Bytes> {
        self.state()
            .write_log
            .iter()
            .filter(|batch| batch.tablet_id == tablet_id)
            .flat_map(|batch| batch.ops.iter().map(|op| op.key.clone()))
            .collect()
    }

    pub fn write_batches(&self) -> usize {
        self.state().write_log.len()
    }

    pub fn transaction(&self, status_tablet_id: &str, txn: TransactionId) -> Option<TransactionUpdate> {
        self.state()
            .transactions
            .get(&(status_tablet_id.to_string(), txn))
            .cloned()
    }

    /// Clients built against this cluster and not yet shut down.
    pub fn open_clients(&self) -> usize {
        self.open_clients.load(Ordering::Acquire)
    }

    /// Delay every `get_changes` on `tablet_id` by `delay`.
    pub fn set_fetch_delay(&self, tablet_id: &str, delay: Duration) {
        self.faults().fetch_delay.insert(tablet_id.to_string(), delay);
    }

    pub fn clear_fetch_delay(&self, tablet_id: &str) {
        self.faults().fetch_delay.remove(tablet_id);
    }

    /// Fail the next `count` fetches on `tablet_id` with `Unavailable`.
    pub fn fail_next_fetches(&self, tablet_id: &str, count: u32) {
        self.faults().fetch_failures.insert(tablet_id.to_string(), count);
    }

    /// Fail the next `count` write batches with `Unavailable`.
    pub fn fail_next_writes(&self, count: u32) {
        self.faults().write_failures = count;
    }

    fn take_fetch_failure(&self, tablet_id: &str) -> bool {
        let mut faults = self.faults();
        match faults.fetch_failures.get_mut(tablet_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            },
            _ => false,
        }
    }

    fn take_write_failure(&self) -> bool {
        let mut faults = self.faults();
        if faults.write_failures > 0 {
            faults.write_failures -= 1;
            true
        } else {
            false
        }
    }

    fn read_changes(&self, request: &GetChangesRequest) -> Result<GetChangesResponse> {
        let mut state = self.state();
        *state.fetches.entry(request.tablet_id.clone()).or_default() += 1;

        let log = state
            .logs
            .get(&(request.stream_id.clone(), request.tablet_id.clone()))
            .ok_or_else(|| ClientError::TabletNotFound(request.tablet_id.clone()))?;

        let records: Vec<ChangeRecord> = log
            .iter()
            .filter(|record| record.op_id > request.from_op_id)
            .take(request.max_records.max(1))
            .cloned()
            .collect();

        Ok(GetChangesResponse {
            records,
            producer_tail: log.last().map(|record| record.op_id),
        })
    }

    fn apply_batch(&self, batch: WriteBatch) {
        let mut state = self.state();
        let rows = state.tablets.entry(batch.tablet_id.clone()).or_default();
        for op in &batch.ops {
            let value = match &op.kind {
                WriteKind::Put { columns } => StoredValue::Row {
                    columns: columns.clone(),
                    transaction_id: op.transaction_id,
                },
                WriteKind::Delete => StoredValue::Tombstone,
            };
            rows.entry(op.key.clone())
                .or_default()
                .insert(op.write_time, value);
        }
        state.write_log.push(batch);
    }

    fn record_transaction(&self, update: TransactionUpdate) {
        let mut state = self.state();
        let key = (update.status_tablet_id.clone(), update.transaction_id);
        // a late Pending must not roll back a commit
        if let Some(existing) = state.transactions.get(&key) {
            if matches!(existing.status, TransactionStatus::Committed { .. })
                && update.status == TransactionStatus::Pending
            {
                return;
            }
        }
        state.transactions.insert(key, update);
    }
}

/// Client handle bound to one [`MemoryCluster`].
pub struct MemoryClient {
    name: String,
    cluster: Arc<MemoryCluster>,
    shut_down: AtomicBool,
    /// Flips to true on shutdown; cuts injected fetch delays short
    closed: watch::Sender<bool>,
}

impl MemoryClient {
    pub fn new(name: impl Into<String>, cluster: Arc<MemoryCluster>) -> Self {
        cluster.open_clients.fetch_add(1, Ordering::AcqRel);
        let (closed, _) = watch::channel(false);
        Self {
            name: name.into(),
            cluster,
            shut_down: AtomicBool::new(false),
            closed,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(ClientError::Shutdown)
        } else {
            Ok(())
        }
    }
}

impl ClusterClient for MemoryClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_changes(&self, request: GetChangesRequest) -> BoxFuture<'_, Result<GetChangesResponse>> {
        Box::pin(async move {
            self.ensure_open()?;
            let delay = self
                .cluster
                .faults()
                .fetch_delay
                .get(&request.tablet_id)
                .copied();
            if let Some(delay) = delay {
                let mut closed = self.closed.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = closed.wait_for(|closed| *closed) => {},
                }
                self.ensure_open()?;
            }
            if self.cluster.take_fetch_failure(&request.tablet_id) {
                return Err(ClientError::Unavailable(format!(
                    "injected fetch failure on {}",
                    request.tablet_id
                )));
            }
            self.cluster.read_changes(&request)
        })
    }

    fn write(&self, batch: WriteBatch) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.cluster.take_write_failure() {
                return Err(ClientError::Unavailable(format!(
                    "injected write failure on {}",
                    batch.tablet_id
                )));
            }
            self.cluster.apply_batch(batch);
            Ok(())
        })
    }

    fn update_transaction(&self, update: TransactionUpdate) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            self.cluster.record_transaction(update);
            Ok(())
        })
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.closed.send_replace(true);
            self.cluster.open_clients.fetch_sub(1, Ordering::AcqRel);
            debug!(
                target: "relay::client",
                client = %self.name,
                cluster = %self.cluster.name,
                "Memory client shut down"
            );
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Resolves master addresses to registered memory clusters.
#[derive(Default)]
pub struct MemoryClientFactory {
    clusters: Mutex<HashMap<String, Arc<MemoryCluster>>>,
    failing_builds: AtomicU32,
    builds: AtomicUsize,
}

impl MemoryClientFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `cluster` for any of `addresses`.
    pub fn register(&self, cluster: &Arc<MemoryCluster>, addresses: &[&str]) {
        let mut clusters = self.clusters.lock().unwrap_or_else(PoisonError::into_inner);
        for addr in addresses {
            clusters.insert((*addr).to_string(), Arc::clone(cluster));
        }
    }

    /// Make the next `count` builds fail with `ConnectionFailed`.
    pub fn fail_next_builds(&self, count: u32) {
        self.failing_builds.store(count, Ordering::Release);
    }

    /// Successful builds so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Acquire)
    }
}

impl ClientFactory for MemoryClientFactory {
    fn build(&self, options: ClientOptions) -> Result<Arc<dyn ClusterClient>> {
        if options.master_addresses.is_empty() {
            return Err(ClientError::InvalidOptions(format!(
                "{}: no master addresses",
                options.client_name
            )));
        }

        let failing = self
            .failing_builds
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ClientError::ConnectionFailed(format!(
                "injected build failure for {}",
                options.client_name
            )));
        }

        let cluster = {
            let clusters = self.clusters.lock().unwrap_or_else(PoisonError::into_inner);
            options
                .master_addresses
                .iter()
                .find_map(|addr| clusters.get(addr).cloned())
        };
        let cluster = cluster.ok_or_else(|| {
            ClientError::ConnectionFailed(format!(
                "no cluster at {}",
                options.master_addresses.join(",")
            ))
        })?;

        self.builds.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryClient::new(options.client_name, cluster)))
    }
}
