//! Producer-to-consumer tablet mapping pushed by the control plane.
//!
//! [`ConsumerRegistry`] is the message as delivered; [`Registry`] is the
//! validated, versioned view the consumer reads from. Refreshes swap the
//! whole view under the write lock, so readers observe one version or the
//! next, never a mix.

use rly_core::{ConsumerTabletInfo, ProducerTabletInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info};

use crate::apply::{ProcessRecordInfo, SchemaVersionMap};

/// Replication configuration for this consumer cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerRegistry {
    /// Producer cluster id -> producer settings
    pub producers: BTreeMap<String, ProducerEntry>,
    /// Route transaction boundary records through transaction status tablets
    pub transactional: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerEntry {
    pub master_addrs: Vec<String>,
    /// Replication from this producer is paused; no tablets are polled
    pub disabled: bool,
    /// Stream id -> stream settings
    pub streams: BTreeMap<String, StreamEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamEntry {
    pub consumer_table_id: String,
    pub producer_table_id: String,
    /// Consumer tablet id -> producer tablet ids feeding it
    pub tablets: BTreeMap<String, Vec<String>>,
    pub schema_versions: Vec<SchemaVersionPair>,
    pub transaction_status_tablet: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVersionPair {
    pub producer: u32,
    pub consumer: u32,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_producer(mut self, cluster_id: impl Into<String>, entry: ProducerEntry) -> Self {
        self.producers.insert(cluster_id.into(), entry);
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    /// True when the registry configures no producer at all.
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

impl ProducerEntry {
    pub fn new<I, S>(master_addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            master_addrs: master_addrs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>, stream: StreamEntry) -> Self {
        self.streams.insert(stream_id.into(), stream);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }
}

impl StreamEntry {
    pub fn new(consumer_table_id: impl Into<String>) -> Self {
        Self {
            consumer_table_id: consumer_table_id.into(),
            ..Self::default()
        }
    }

    pub fn with_producer_table(mut self, producer_table_id: impl Into<String>) -> Self {
        self.producer_table_id = producer_table_id.into();
        self
    }

    pub fn with_tablet<I, S>(mut self, consumer_tablet_id: impl Into<String>, producer_tablets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tablets
            .entry(consumer_tablet_id.into())
            .or_default()
            .extend(producer_tablets.into_iter().map(Into::into));
        self
    }

    pub fn with_schema_version(mut self, producer: u32, consumer: u32) -> Self {
        self.schema_versions.push(SchemaVersionPair { producer, consumer });
        self
    }

    pub fn with_status_tablet(mut self, tablet_id: impl Into<String>) -> Self {
        self.transaction_status_tablet = Some(tablet_id.into());
        self
    }
}

/// Result of [`Registry::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The new version was installed.
    Applied {
        version: i32,
        tablets: usize,
        skipped: usize,
    },
    /// The registry was empty or absent; replication is off until the next version.
    Disabled { version: i32 },
    /// `version` was not newer than the installed one; nothing changed.
    Stale { version: i32, current: i32 },
}

impl RefreshOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Stale { .. })
    }
}

#[derive(Debug, Clone)]
struct StreamSettings {
    schema_versions: Arc<SchemaVersionMap>,
    status_tablet: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    version: Option<i32>,
    mapping: Arc<HashMap<ProducerTabletInfo, ConsumerTabletInfo>>,
    endpoints: HashMap<String, Vec<String>>,
    listed: HashSet<String>,
    streams: HashMap<(String, String), StreamSettings>,
    transactional: bool,
}

/// Versioned tablet mapping behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `registry` as `version` unless an equal or newer version is
    /// already installed. `None` or an empty registry disables replication.
    pub fn refresh(&self, registry: Option<&ConsumerRegistry>, version: i32) -> RefreshOutcome {
        // build outside the lock; the write lock only guards the swap
        let next = match registry {
            Some(registry) if !registry.is_empty() => Some(build_state(registry, version)),
            _ => None,
        };

        let mut state = self.write();
        if let Some(current) = state.version {
            if version <= current {
                drop(state);
                rly_metrics::increment_registry_stale_refreshes();
                debug!(
                    target: "relay::registry",
                    version,
                    current,
                    "Ignoring registry refresh that is not newer than the installed version"
                );
                return RefreshOutcome::Stale { version, current };
            }
        }

        let outcome = match next {
            Some((next, skipped)) => {
                let tablets = next.mapping.len();
                *state = next;
                RefreshOutcome::Applied {
                    version,
                    tablets,
                    skipped,
                }
            },
            None => {
                *state = RegistryState {
                    version: Some(version),
                    ..RegistryState::default()
                };
                RefreshOutcome::Disabled { version }
            },
        };
        drop(state);

        rly_metrics::increment_registry_refreshes();
        rly_metrics::set_registry_version(version);
        match outcome {
            RefreshOutcome::Applied {
                tablets, skipped, ..
            } => info!(
                target: "relay::registry",
                version,
                tablets,
                skipped,
                "Registry refreshed"
            ),
            _ => info!(
                target: "relay::registry",
                version,
                "Registry empty, replication disabled"
            ),
        }
        outcome
    }

    pub fn lookup(&self, key: &ProducerTabletInfo) -> Option<ConsumerTabletInfo> {
        self.read().mapping.get(key).cloned()
    }

    pub fn contains(&self, key: &ProducerTabletInfo) -> bool {
        self.read().mapping.contains_key(key)
    }

    /// The current mapping. Later refreshes do not affect the returned map.
    pub fn snapshot(&self) -> Arc<HashMap<ProducerTabletInfo, ConsumerTabletInfo>> {
        Arc::clone(&self.read().mapping)
    }

    pub fn endpoints(&self, cluster_id: &str) -> Option<Vec<String>> {
        self.read().endpoints.get(cluster_id).cloned()
    }

    /// Whether the installed registry names the producer cluster, enabled or not.
    pub fn lists_cluster(&self, cluster_id: &str) -> bool {
        self.read().listed.contains(cluster_id)
    }

    pub fn version(&self) -> Option<i32> {
        self.read().version
    }

    pub fn len(&self) -> usize {
        self.read().mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().mapping.is_empty()
    }

    /// Apply settings for the next cycle of `key`, `None` once the key is unmapped.
    pub fn process_record_info(&self, key: &ProducerTabletInfo) -> Option<ProcessRecordInfo> {
        let state = self.read();
        let consumer = state.mapping.get(key)?;
        let stream = state
            .streams
            .get(&(key.producer_cluster_id.clone(), key.stream_id.clone()));

        Some(ProcessRecordInfo {
            consumer_tablet_id: consumer.consumer_tablet_id.clone(),
            transactional: state.transactional,
            status_tablet_id: stream.and_then(|s| s.status_tablet.clone()),
            schema_versions: stream
                .map(|s| Arc::clone(&s.schema_versions))
                .unwrap_or_default(),
        })
    }
}

fn build_state(registry: &ConsumerRegistry, version: i32) -> (RegistryState, usize) {
    let mut mapping = HashMap::new();
    let mut endpoints = HashMap::new();
    let mut listed = HashSet::new();
    let mut streams = HashMap::new();
    let mut skipped = 0usize;

    for (cluster_id, producer) in &registry.producers {
        listed.insert(cluster_id.clone());
        if !producer.master_addrs.is_empty() {
            endpoints.insert(cluster_id.clone(), producer.master_addrs.clone());
        }
        if producer.disabled {
            debug!(
                target: "relay::registry",
                cluster = %cluster_id,
                "Producer disabled, not mapping its tablets"
            );
            continue;
        }

        for (stream_id, stream) in &producer.streams {
            if stream.consumer_table_id.is_empty() {
                skipped += stream.tablets.values().map(Vec::len).sum::<usize>().max(1);
                corrupt_entry(cluster_id, stream_id, "missing consumer table id");
                continue;
            }

            let mut seen = HashSet::new();
            for (consumer_tablet, producer_tablets) in &stream.tablets {
                if consumer_tablet.is_empty() {
                    skipped += producer_tablets.len().max(1);
                    corrupt_entry(cluster_id, stream_id, "empty consumer tablet id");
                    continue;
                }
                for producer_tablet in producer_tablets {
                    if producer_tablet.is_empty() || !seen.insert(producer_tablet.as_str()) {
                        skipped += 1;
                        corrupt_entry(
                            cluster_id,
                            stream_id,
                            "empty or duplicate producer tablet id",
                        );
                        continue;
                    }
                    mapping.insert(
                        ProducerTabletInfo::new(cluster_id, stream_id, producer_tablet),
                        ConsumerTabletInfo::new(consumer_tablet, &stream.consumer_table_id),
                    );
                }
            }

            let schema_versions: SchemaVersionMap = stream
                .schema_versions
                .iter()
                .map(|pair| (pair.producer, pair.consumer))
                .collect();
            streams.insert(
                (cluster_id.clone(), stream_id.clone()),
                StreamSettings {
                    schema_versions: Arc::new(schema_versions),
                    status_tablet: stream.transaction_status_tablet.clone(),
                },
            );
        }
    }

    let state = RegistryState {
        version: Some(version),
        mapping: Arc::new(mapping),
        endpoints,
        listed,
        streams,
        transactional: registry.transactional,
    };
    (state, skipped)
}

fn corrupt_entry(cluster_id: &str, stream_id: &str, reason: &str) {
    rly_metrics::increment_registry_corrupt_entries();
    error!(
        target: "relay::registry",
        cluster = %cluster_id,
        stream = %stream_id,
        reason,
        "Data corruption in registry entry, skipping"
    );
}
