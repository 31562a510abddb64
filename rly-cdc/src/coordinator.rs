//! The replication consumer.
//!
//! [`CdcConsumer`] owns the registry, the producer client pool, the set of
//! active pollers and two execution contexts:
//!
//! - a dedicated trigger thread that reconciles "should be polling" against
//!   "is polling" every trigger interval, or sooner when woken by a registry
//!   refresh or shutdown;
//! - a bounded tokio worker runtime on which every tablet poller runs.
//!
//! Pollers keep only a `Weak` reference to the consumer state and remove
//! themselves through [`ConsumerInner::remove_from_active_set`]; the consumer
//! never tears a poller down from outside. Locks are always taken registry
//! first, then the poller set or the client pool, and no lock is held across
//! client construction or shutdown.

use rly_client::{ClientFactory, ClientOptions, ClusterClient};
use rly_core::{ConsumerTabletInfo, HybridLogicalClock, OpId, ProducerTabletInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::apply::ApplyPipeline;
use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::client_pool::{EvictedClient, RemoteClientPool};
use crate::config::ConsumerConfig;
use crate::error::{CdcError, Result};
use crate::poller::{PollerInfo, PollerSettings, PollerState, PollerStatus, TabletPoller};
use crate::registry::{ConsumerRegistry, RefreshOutcome, Registry};

/// Answers whether this node leads a local tablet.
///
/// Supplied by the surrounding server. Any `Fn(&str) -> bool` qualifies.
pub trait TabletLeadership: Send + Sync {
    fn is_leader_for_tablet(&self, tablet_id: &str) -> bool;
}

impl<F> TabletLeadership for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_leader_for_tablet(&self, tablet_id: &str) -> bool {
        self(tablet_id)
    }
}

/// Collaborators a consumer is built with.
pub struct ConsumerDeps {
    pub client_factory: Arc<dyn ClientFactory>,
    pub leadership: Arc<dyn TabletLeadership>,
    /// Masters of the local (consumer) cluster
    pub local_master_addrs: Vec<String>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl ConsumerDeps {
    pub fn new(
        client_factory: Arc<dyn ClientFactory>,
        leadership: Arc<dyn TabletLeadership>,
        local_master_addrs: Vec<String>,
    ) -> Self {
        Self {
            client_factory,
            leadership,
            local_master_addrs,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Stopped = 0,
    Running = 1,
    ShuttingDown = 2,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }
}

struct PollerEntry {
    consumer_tablet_id: String,
    cluster_id: String,
    status: Arc<PollerStatus>,
}

/// Wakes the trigger thread ahead of its period.
#[derive(Default)]
struct TriggerSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl TriggerSignal {
    fn wake(&self) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }

    /// Block until woken or `timeout` elapses.
    fn wait(&self, timeout: Duration) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
    }
}

/// Consumer state shared with the trigger thread and, weakly, with pollers.
pub(crate) struct ConsumerInner {
    config: ConsumerConfig,
    registry: Registry,
    pool: RemoteClientPool,
    pollers: Mutex<HashMap<ProducerTabletInfo, PollerEntry>>,
    leadership: Arc<dyn TabletLeadership>,
    pipeline: Arc<ApplyPipeline>,
    checkpoints: Arc<dyn CheckpointStore>,
    clock: Arc<HybridLogicalClock>,
    local: Arc<dyn ClusterClient>,
    state: AtomicU8,
    trigger: TriggerSignal,
    shutdown_tx: watch::Sender<bool>,
    runtime: Handle,
}

impl ConsumerInner {
    fn pollers(&self) -> MutexGuard<'_, HashMap<ProducerTabletInfo, PollerEntry>> {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_running(&self) -> bool {
        self.state() == ConsumerState::Running
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn pipeline(&self) -> Arc<ApplyPipeline> {
        Arc::clone(&self.pipeline)
    }

    pub(crate) fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// False once `key` is unmapped, this node stops leading its consumer
    /// tablet, or the consumer is shutting down.
    pub(crate) fn should_continue_polling(&self, key: &ProducerTabletInfo) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.registry.lookup(key) {
            Some(consumer) => self
                .leadership
                .is_leader_for_tablet(&consumer.consumer_tablet_id),
            None => false,
        }
    }

    /// Drop the poller of `key` from the active set and release its client
    /// reference. The returned client, if any, must be shut down by the caller.
    pub(crate) fn remove_from_active_set(&self, key: &ProducerTabletInfo) -> Option<EvictedClient> {
        let entry = self.pollers().remove(key)?;
        entry.status.set_state(PollerState::Stopped);
        rly_metrics::poller_stopped();
        debug!(
            target: "relay::cdc",
            tablet = %key,
            consumer_tablet = %entry.consumer_tablet_id,
            "Removed poller from active set"
        );
        self.pool.release(&entry.cluster_id, &self.registry)
    }

    fn has_poller(&self, key: &ProducerTabletInfo) -> bool {
        self.pollers().contains_key(key)
    }

    /// One reconciliation pass. Returns the number of pollers started.
    fn trigger_poll_for_new_tablets(self: &Arc<Self>) -> usize {
        if !self.is_running() {
            return 0;
        }

        let snapshot = self.registry.snapshot();
        let mut started = 0;
        for (key, consumer) in snapshot.iter() {
            if self.has_poller(key) {
                continue;
            }
            if !self
                .leadership
                .is_leader_for_tablet(&consumer.consumer_tablet_id)
            {
                continue;
            }
            if self.start_poller(key, consumer) {
                started += 1;
            }
        }

        for evicted in self.pool.sweep(&self.registry) {
            evicted.shutdown();
        }
        started
    }

    fn start_poller(self: &Arc<Self>, key: &ProducerTabletInfo, consumer: &ConsumerTabletInfo) -> bool {
        let handle = match self.pool.get_or_create(&key.producer_cluster_id, &self.registry) {
            Ok(handle) => handle,
            Err(CdcError::ShuttingDown) => return false,
            Err(e) => {
                debug!(
                    target: "relay::cdc",
                    tablet = %key,
                    error = %e,
                    "Cannot start poller yet, retrying next pass"
                );
                return false;
            },
        };

        let from = match self.checkpoints.load(key) {
            Ok(checkpoint) => checkpoint.unwrap_or(OpId::MIN),
            Err(e) => {
                warn!(
                    target: "relay::cdc",
                    tablet = %key,
                    error = %e,
                    "Failed to load checkpoint, polling from the start"
                );
                OpId::MIN
            },
        };
        let status = Arc::new(PollerStatus::new(from));

        let inserted = {
            let mut pollers = self.pollers();
            if pollers.contains_key(key) || !self.is_running() {
                false
            } else {
                pollers.insert(
                    key.clone(),
                    PollerEntry {
                        consumer_tablet_id: consumer.consumer_tablet_id.clone(),
                        cluster_id: key.producer_cluster_id.clone(),
                        status: Arc::clone(&status),
                    },
                );
                true
            }
        };
        if !inserted {
            // lost the race to another pass; hand the reference back
            if let Some(evicted) = self.pool.release(&key.producer_cluster_id, &self.registry) {
                evicted.shutdown();
            }
            return false;
        }

        let poller = TabletPoller::new(
            key.clone(),
            Arc::downgrade(self),
            handle,
            status,
            self.shutdown_tx.subscribe(),
            PollerSettings {
                poll_delay: self.config.poll_delay,
                rpc_timeout: self.config.rpc_timeout,
                max_records: self.config.max_records_per_fetch,
            },
        );
        self.runtime.spawn(poller.run());

        rly_metrics::poller_started();
        info!(
            target: "relay::cdc",
            tablet = %key,
            consumer_tablet = %consumer.consumer_tablet_id,
            from = %from,
            "Started tablet poller"
        );
        true
    }

    fn run_trigger_loop(self: Arc<Self>) {
        debug!(
            target: "relay::cdc",
            interval = ?self.config.trigger_interval,
            "Trigger loop started"
        );
        while self.is_running() {
            self.trigger_poll_for_new_tablets();
            self.trigger.wait(self.config.trigger_interval);
        }
        debug!(target: "relay::cdc", "Trigger loop exited");
    }
}

/// Cross-cluster replication consumer.
///
/// Must be shut down (explicitly or by drop) outside of any tokio runtime:
/// shutdown stops the consumer's own worker runtime.
pub struct CdcConsumer {
    inner: Arc<ConsumerInner>,
    runtime: Mutex<Option<Runtime>>,
    trigger_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CdcConsumer {
    /// Build the local client, the worker runtime and the trigger thread.
    ///
    /// Failing to build the local client is fatal.
    pub fn create(config: ConsumerConfig, deps: ConsumerDeps) -> Result<Self> {
        let local_options =
            ClientOptions::new(deps.local_master_addrs.clone(), config.local_client_name.clone())
                .with_rpc_timeout(config.rpc_timeout);
        let local = deps.client_factory.build(local_options).map_err(|e| {
            error!(
                target: "relay::cdc",
                error = %e,
                masters = ?deps.local_master_addrs,
                "Failed to create local client"
            );
            CdcError::LocalClient(e)
        })?;

        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("relay-cdc-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                local.shutdown();
                return Err(CdcError::Runtime(e));
            },
        };

        let clock = Arc::new(HybridLogicalClock::new());
        let pipeline = Arc::new(ApplyPipeline::new(
            Arc::clone(&local),
            Arc::clone(&clock),
            config.bad_record_policy,
        ));
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new(ConsumerInner {
            pool: RemoteClientPool::new(deps.client_factory, config.rpc_timeout),
            registry: Registry::new(),
            pollers: Mutex::new(HashMap::new()),
            leadership: deps.leadership,
            pipeline,
            checkpoints: deps.checkpoints,
            clock,
            local,
            state: AtomicU8::new(ConsumerState::Running as u8),
            trigger: TriggerSignal::default(),
            shutdown_tx,
            runtime: runtime.handle().clone(),
            config,
        });

        let trigger_inner = Arc::clone(&inner);
        let trigger_thread = std::thread::Builder::new()
            .name("relay-cdc-trigger".to_string())
            .spawn(move || trigger_inner.run_trigger_loop());
        let trigger_thread = match trigger_thread {
            Ok(thread) => thread,
            Err(e) => {
                inner
                    .state
                    .store(ConsumerState::Stopped as u8, Ordering::Release);
                runtime.shutdown_background();
                inner.local.shutdown();
                return Err(CdcError::Runtime(e));
            },
        };

        info!(
            target: "relay::cdc",
            workers = inner.config.worker_threads,
            trigger_interval = ?inner.config.trigger_interval,
            poll_delay = ?inner.config.poll_delay,
            "CDC consumer started"
        );

        Ok(Self {
            inner,
            runtime: Mutex::new(Some(runtime)),
            trigger_thread: Mutex::new(Some(trigger_thread)),
        })
    }

    /// Install a registry pushed by the control plane and wake the trigger loop.
    ///
    /// Never blocks on I/O. Versions not newer than the installed one are ignored.
    pub fn refresh_with_new_registry_from_master(
        &self,
        registry: Option<&ConsumerRegistry>,
        version: i32,
    ) -> RefreshOutcome {
        let outcome = self.inner.registry.refresh(registry, version);
        if outcome.is_applied() {
            self.inner.trigger.wake();
        }
        outcome
    }

    /// Run one reconciliation pass now, on the calling thread.
    ///
    /// Safe to call concurrently with the trigger loop; at most one poller
    /// exists per producer tablet.
    pub fn trigger_poll_for_new_tablets(&self) -> usize {
        self.inner.trigger_poll_for_new_tablets()
    }

    pub fn should_continue_polling(&self, key: &ProducerTabletInfo) -> bool {
        self.inner.should_continue_polling(key)
    }

    /// Producer tablet ids with an active poller, sorted.
    pub fn list_active_poller_tablet_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .pollers()
            .keys()
            .map(|key| key.producer_tablet_id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_pollers(&self) -> Vec<PollerInfo> {
        let mut pollers: Vec<PollerInfo> = self
            .inner
            .pollers()
            .iter()
            .map(|(key, entry)| PollerInfo {
                producer: key.clone(),
                consumer_tablet_id: entry.consumer_tablet_id.clone(),
                state: entry.status.state(),
                last_processed: entry.status.last_processed(),
            })
            .collect();
        pollers.sort_unstable_by(|a, b| a.producer.cmp(&b.producer));
        pollers
    }

    /// Producer clusters with a live client, sorted.
    pub fn remote_cluster_ids(&self) -> Vec<String> {
        self.inner.pool.cluster_ids()
    }

    pub fn registry_version(&self) -> Option<i32> {
        self.inner.registry.version()
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state()
    }

    /// Local hybrid clock, advanced past every applied record.
    pub fn clock(&self) -> &Arc<HybridLogicalClock> {
        &self.inner.clock
    }

    /// Stop the consumer. Idempotent.
    ///
    /// Signals pollers and the trigger loop, shuts down every producer client
    /// (unblocking in-flight fetches), joins the trigger thread, stops the
    /// worker runtime within the configured timeout and shuts down the local
    /// client last.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                ConsumerState::Running as u8,
                ConsumerState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        info!(target: "relay::cdc", "CDC consumer shutting down");

        inner.shutdown_tx.send_replace(true);
        inner.trigger.wake();

        for evicted in inner.pool.drain() {
            evicted.shutdown();
        }

        let trigger_thread = self
            .trigger_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = trigger_thread {
            if thread.join().is_err() {
                error!(target: "relay::cdc", "Trigger thread panicked");
            }
        }

        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(inner.config.shutdown_timeout);
        }

        // pollers cut off by the runtime never reached their own teardown
        let leftover: Vec<PollerEntry> = inner.pollers().drain().map(|(_, entry)| entry).collect();
        for entry in &leftover {
            entry.status.set_state(PollerState::Stopped);
            rly_metrics::poller_stopped();
        }
        if !leftover.is_empty() {
            warn!(
                target: "relay::cdc",
                pollers = leftover.len(),
                "Pollers still registered at shutdown"
            );
        }

        inner.local.shutdown();
        inner
            .state
            .store(ConsumerState::Stopped as u8, Ordering::Release);
        info!(target: "relay::cdc", "CDC consumer stopped");
    }
}

impl Drop for CdcConsumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
