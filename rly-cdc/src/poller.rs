//! Per producer tablet fetch and apply loop.
//!
//! A poller is one tokio task. Each cycle it asks the consumer whether it
//! should keep going, fetches records after its checkpoint, applies them and
//! sleeps for the poll delay. Cycles of one tablet never overlap; tablets are
//! independent tasks on the shared worker runtime.

use rly_client::{ClientError, GetChangesRequest};
use rly_core::{OpId, ProducerTabletInfo};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::apply::{ApplyPipeline, ProcessRecordInfo};
use crate::client_pool::RemoteClientHandle;
use crate::coordinator::ConsumerInner;
use crate::error::{ApplyError, CdcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PollerState {
    /// Waiting for the next cycle
    Scheduled = 0,
    Fetching = 1,
    Applying = 2,
    /// Terminal
    Stopped = 3,
}

impl PollerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Scheduled,
            1 => Self::Fetching,
            2 => Self::Applying,
            _ => Self::Stopped,
        }
    }
}

/// State shared between a running poller and the consumer's poller set.
#[derive(Debug)]
pub struct PollerStatus {
    state: AtomicU8,
    last_processed: Mutex<OpId>,
}

impl PollerStatus {
    pub fn new(last_processed: OpId) -> Self {
        Self {
            state: AtomicU8::new(PollerState::Scheduled as u8),
            last_processed: Mutex::new(last_processed),
        }
    }

    pub fn state(&self) -> PollerState {
        PollerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: PollerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Last record applied or skipped; fetches resume after it.
    pub fn last_processed(&self) -> OpId {
        *self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, op_id: OpId) {
        let mut last = self
            .last_processed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if op_id > *last {
            *last = op_id;
        }
    }
}

/// Point-in-time view of one active poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerInfo {
    pub producer: ProducerTabletInfo,
    pub consumer_tablet_id: String,
    pub state: PollerState,
    pub last_processed: OpId,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct PollerSettings {
    pub poll_delay: Duration,
    pub rpc_timeout: Duration,
    pub max_records: usize,
}

pub(crate) struct TabletPoller {
    key: ProducerTabletInfo,
    consumer: Weak<ConsumerInner>,
    handle: RemoteClientHandle,
    status: Arc<PollerStatus>,
    shutdown: watch::Receiver<bool>,
    settings: PollerSettings,
}

impl TabletPoller {
    pub(crate) fn new(
        key: ProducerTabletInfo,
        consumer: Weak<ConsumerInner>,
        handle: RemoteClientHandle,
        status: Arc<PollerStatus>,
        shutdown: watch::Receiver<bool>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            key,
            consumer,
            handle,
            status,
            shutdown,
            settings,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!(
            target: "relay::poller",
            tablet = %self.key,
            from = %self.status.last_processed(),
            "Poller started"
        );

        loop {
            let Some(consumer) = self.consumer.upgrade() else {
                self.status.set_state(PollerState::Stopped);
                debug!(target: "relay::poller", tablet = %self.key, "Consumer gone, poller exiting");
                return;
            };

            let info = if consumer.should_continue_polling(&self.key) {
                consumer.registry().process_record_info(&self.key)
            } else {
                None
            };
            let Some(info) = info else {
                let evicted = consumer.remove_from_active_set(&self.key);
                drop(consumer);
                self.status.set_state(PollerState::Stopped);
                info!(
                    target: "relay::poller",
                    tablet = %self.key,
                    last_processed = %self.status.last_processed(),
                    "Poller stopped"
                );
                if let Some(evicted) = evicted {
                    if let Err(e) = tokio::task::spawn_blocking(move || evicted.shutdown()).await {
                        warn!(target: "relay::poller", error = %e, "Remote client shutdown task failed");
                    }
                }
                return;
            };

            let pipeline = consumer.pipeline();
            drop(consumer);

            self.poll_once(&pipeline, &info).await;

            self.status.set_state(PollerState::Scheduled);
            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_delay) => {},
                _ = self.shutdown.changed() => {},
            }
        }
    }

    async fn poll_once(&self, pipeline: &ApplyPipeline, info: &ProcessRecordInfo) {
        self.status.set_state(PollerState::Fetching);
        let request = GetChangesRequest {
            stream_id: self.key.stream_id.clone(),
            tablet_id: self.key.producer_tablet_id.clone(),
            from_op_id: self.status.last_processed(),
            max_records: self.settings.max_records,
        };

        let fetched = {
            let _timer = rly_metrics::LATENCY_FETCH.start();
            tokio::time::timeout(
                self.settings.rpc_timeout,
                self.handle.client().get_changes(request),
            )
            .await
            .unwrap_or(Err(ClientError::Timeout))
        };

        let response = match fetched {
            Ok(response) => response,
            Err(source) => {
                self.fetch_failed(CdcError::Fetch {
                    tablet: self.key.producer_tablet_id.clone(),
                    source,
                });
                return;
            },
        };

        let count = response.records.len();
        rly_metrics::increment_records_fetched(count as u64);
        if count > 0 {
            debug!(
                target: "relay::poller",
                tablet = %self.key,
                records = count,
                producer_tail = ?response.producer_tail,
                "Fetched records"
            );
        }

        self.status.set_state(PollerState::Applying);
        let applied = {
            let _timer = rly_metrics::LATENCY_APPLY.start();
            pipeline.apply(&response.records, info).await
        };

        match applied {
            Ok(outcome) => {
                if let Some(op_id) = outcome.last_op_id {
                    self.checkpoint(op_id);
                }
            },
            Err(err) => {
                if let Some(op_id) = err.applied_through() {
                    self.checkpoint(op_id);
                }
                self.apply_failed(&err);
            },
        }
    }

    fn checkpoint(&self, op_id: OpId) {
        self.status.advance(op_id);
        let Some(consumer) = self.consumer.upgrade() else {
            return;
        };
        if let Err(e) = consumer.checkpoints().save(&self.key, op_id) {
            warn!(
                target: "relay::poller",
                tablet = %self.key,
                op_id = %op_id,
                error = %e,
                "Failed to save checkpoint"
            );
        }
    }

    fn fetch_failed(&self, err: CdcError) {
        rly_metrics::increment_fetch_errors();
        let shut_down = matches!(
            err,
            CdcError::Fetch {
                source: ClientError::Shutdown,
                ..
            }
        );
        if shut_down {
            debug!(target: "relay::poller", tablet = %self.key, "Fetch interrupted by client shutdown");
        } else {
            warn!(
                target: "relay::poller",
                tablet = %self.key,
                error = %err,
                retry_in = ?self.settings.poll_delay,
                "Fetch failed"
            );
        }
    }

    fn apply_failed(&self, err: &ApplyError) {
        rly_metrics::increment_apply_errors();
        if matches!(err, ApplyError::SchemaVersionMismatch { .. }) {
            rly_metrics::increment_schema_mismatches();
        }
        if err.is_retryable() {
            warn!(
                target: "relay::poller",
                tablet = %self.key,
                error = %err,
                "Apply failed, retrying the same records next cycle"
            );
        } else {
            error!(
                target: "relay::poller",
                tablet = %self.key,
                error = %err,
                "Apply halted"
            );
        }
    }
}
