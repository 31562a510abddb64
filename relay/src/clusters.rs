//! In-process clusters the relay runs against.
//!
//! The local cluster and every producer named in the registry are memory
//! clusters served by one [`MemoryClientFactory`]. Producers are registered
//! under their configured master addresses as they appear in the registry,
//! and can be fed synthetic writes.

use bytes::Bytes;
use rly_cdc::{ConsumerRegistry, StreamEntry};
use rly_client::{MemoryClientFactory, MemoryCluster};
use rly_core::{ChangeRecord, ColumnValue, HybridLogicalClock, OpId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Term stamped on every synthetic record.
const DEMO_TERM: u64 = 1;

struct Producer {
    cluster: Arc<MemoryCluster>,
    clock: HybridLogicalClock,
    /// (stream, tablet) -> last index appended
    next_index: HashMap<(String, String), u64>,
}

pub struct InProcessClusters {
    factory: Arc<MemoryClientFactory>,
    local: Arc<MemoryCluster>,
    producers: HashMap<String, Producer>,
}

impl InProcessClusters {
    pub fn new(local_master_addrs: &[String]) -> Self {
        let factory = MemoryClientFactory::new();
        let local = MemoryCluster::new("local");
        let addrs: Vec<&str> = local_master_addrs.iter().map(String::as_str).collect();
        factory.register(&local, &addrs);

        Self {
            factory,
            local,
            producers: HashMap::new(),
        }
    }

    pub fn factory(&self) -> Arc<MemoryClientFactory> {
        Arc::clone(&self.factory)
    }

    pub fn local(&self) -> &Arc<MemoryCluster> {
        &self.local
    }

    /// Register producers first seen in `registry`. Returns how many were added.
    pub fn sync_registry(&mut self, registry: &ConsumerRegistry) -> usize {
        let mut added = 0;
        for (cluster_id, entry) in &registry.producers {
            if entry.master_addrs.is_empty() || self.producers.contains_key(cluster_id) {
                continue;
            }

            let cluster = MemoryCluster::new(cluster_id.clone());
            let addrs: Vec<&str> = entry.master_addrs.iter().map(String::as_str).collect();
            self.factory.register(&cluster, &addrs);

            info!(
                target: "relay::clusters",
                cluster_id = %cluster_id,
                masters = ?entry.master_addrs,
                "Producer cluster registered"
            );

            self.producers.insert(
                cluster_id.clone(),
                Producer {
                    cluster,
                    clock: HybridLogicalClock::new(),
                    next_index: HashMap::new(),
                },
            );
            added += 1;
        }
        added
    }

    /// Append `per_tablet` writes to every producer tablet of every enabled
    /// stream in `registry`. Returns the number of records appended.
    pub fn write_demo_records(&mut self, registry: &ConsumerRegistry, per_tablet: usize) -> usize {
        let mut appended = 0;
        for (cluster_id, entry) in &registry.producers {
            if entry.disabled {
                continue;
            }
            let Some(producer) = self.producers.get_mut(cluster_id) else {
                continue;
            };

            for (stream_id, stream) in &entry.streams {
                let Some(schema_version) = producer_schema_version(stream) else {
                    debug!(
                        target: "relay::clusters",
                        cluster_id = %cluster_id,
                        stream_id = %stream_id,
                        "Stream has no schema version mapping, no demo writes"
                    );
                    continue;
                };

                for tablet_id in stream.tablets.values().flatten() {
                    appended += producer.append_writes(stream_id, tablet_id, schema_version, per_tablet);
                }
            }
        }
        appended
    }
}

impl Producer {
    fn append_writes(
        &mut self,
        stream_id: &str,
        tablet_id: &str,
        schema_version: u32,
        count: usize,
    ) -> usize {
        let index = self
            .next_index
            .entry((stream_id.to_string(), tablet_id.to_string()))
            .or_insert(0);

        let mut records = Vec::with_capacity(count);
        for _ in 0..count {
            *index += 1;
            let key = Bytes::from(format!("{tablet_id}-{:08}", *index));
            let value = Bytes::from(format!("v{}", *index));
            records.push(ChangeRecord::write(
                OpId::new(DEMO_TERM, *index),
                key,
                vec![ColumnValue::new(0, schema_version, value)],
                self.clock.now(),
            ));
        }

        self.cluster.append(stream_id, tablet_id, records);
        count
    }
}

/// Producer schema version to stamp synthetic columns with.
fn producer_schema_version(stream: &StreamEntry) -> Option<u32> {
    stream.schema_versions.iter().map(|pair| pair.producer).max()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rly_cdc::ProducerEntry;
    use rly_client::{ClientFactory, ClientOptions, ClusterClient};

    fn registry() -> ConsumerRegistry {
        ConsumerRegistry::new()
            .with_producer(
                "pc1",
                ProducerEntry::new(["host1:9100"]).with_stream(
                    "s1",
                    StreamEntry::new("tb1")
                        .with_tablet("ct1", ["pt1", "pt2"])
                        .with_schema_version(6, 1),
                ),
            )
            .with_producer(
                "pc2",
                ProducerEntry::new(["host2:9100"])
                    .with_stream("s2", StreamEntry::new("tb2").with_tablet("ct2", ["pt3"]))
                    .disabled(),
            )
    }

    #[test]
    fn test_local_cluster_resolves() {
        let clusters = InProcessClusters::new(&["local:7100".to_string()]);
        let client = clusters
            .factory()
            .build(ClientOptions::new(vec!["local:7100".into()], "t"))
            .unwrap();
        assert!(!client.is_shutdown());
        client.shutdown();
    }

    #[test]
    fn test_sync_registers_once() {
        let mut clusters = InProcessClusters::new(&["local:7100".to_string()]);
        assert_eq!(clusters.sync_registry(&registry()), 2);
        assert_eq!(clusters.sync_registry(&registry()), 0);

        let factory = clusters.factory();
        let client = factory
            .build(ClientOptions::new(vec!["host2:9100".into()], "t"))
            .unwrap();
        client.shutdown();
        assert!(factory
            .build(ClientOptions::new(vec!["host3:9100".into()], "t"))
            .is_err());
    }

    #[test]
    fn test_demo_writes_follow_mapping() {
        let mut clusters = InProcessClusters::new(&["local:7100".to_string()]);
        let registry = registry();
        clusters.sync_registry(&registry);

        // pc2 is disabled, so only pt1 and pt2 are fed.
        assert_eq!(clusters.write_demo_records(&registry, 3), 6);
        assert_eq!(clusters.write_demo_records(&registry, 2), 4);
    }
}
