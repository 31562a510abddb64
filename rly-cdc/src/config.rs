use std::time::Duration;

use crate::apply::BadRecordPolicy;

/// Tunables of a [`CdcConsumer`](crate::CdcConsumer).
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Period of the trigger loop that starts pollers for newly led tablets
    pub trigger_interval: Duration,
    /// Delay between two poll cycles of one producer tablet, after success or failure
    pub poll_delay: Duration,
    /// RPC timeout of every client the consumer builds
    pub rpc_timeout: Duration,
    /// Worker threads shared by all pollers
    pub worker_threads: usize,
    /// Upper bound of records requested per fetch
    pub max_records_per_fetch: usize,
    pub bad_record_policy: BadRecordPolicy,
    /// How long shutdown waits for in-flight poller work before dropping it
    pub shutdown_timeout: Duration,
    /// Diagnostic name of the local (consumer-side) client
    pub local_client_name: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            trigger_interval: Duration::from_millis(rly_core::DEFAULT_TRIGGER_INTERVAL_MS),
            poll_delay: Duration::from_millis(rly_core::DEFAULT_POLL_DELAY_MS),
            rpc_timeout: Duration::from_secs(rly_core::DEFAULT_RPC_TIMEOUT_SECS),
            worker_threads: 4,
            max_records_per_fetch: 1024,
            bad_record_policy: BadRecordPolicy::default(),
            shutdown_timeout: Duration::from_secs(5),
            local_client_name: "cdc-consumer-local".to_string(),
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trigger_interval(mut self, interval: Duration) -> Self {
        self.trigger_interval = interval;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Values below one are raised to one.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_max_records_per_fetch(mut self, max: usize) -> Self {
        self.max_records_per_fetch = max.max(1);
        self
    }

    pub fn with_bad_record_policy(mut self, policy: BadRecordPolicy) -> Self {
        self.bad_record_policy = policy;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_local_client_name(mut self, name: impl Into<String>) -> Self {
        self.local_client_name = name.into();
        self
    }
}
