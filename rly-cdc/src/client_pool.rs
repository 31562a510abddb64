//! One long-lived client per producer cluster, shared by its tablet pollers.

use rly_client::{ClientFactory, ClientOptions, ClusterClient};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{CdcError, Result};
use crate::registry::Registry;

/// A counted reference to a producer cluster client.
///
/// Obtained from [`RemoteClientPool::get_or_create`] and handed back through
/// [`RemoteClientPool::release`]; dropping it does not release the count.
#[derive(Clone)]
pub struct RemoteClientHandle {
    cluster_id: String,
    client: Arc<dyn ClusterClient>,
}

impl RemoteClientHandle {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }
}

impl fmt::Debug for RemoteClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClientHandle")
            .field("cluster_id", &self.cluster_id)
            .field("client", &self.client.name())
            .finish()
    }
}

/// A client removed from the pool. Shut it down outside every consumer lock.
#[must_use = "evicted clients must be shut down"]
pub struct EvictedClient {
    pub cluster_id: String,
    pub client: Arc<dyn ClusterClient>,
}

impl EvictedClient {
    /// Close the client. May block on in-flight RPCs.
    pub fn shutdown(self) {
        self.client.shutdown();
        rly_metrics::remote_client_shutdown();
        info!(
            target: "relay::pool",
            cluster = %self.cluster_id,
            "Remote client shut down"
        );
    }
}

struct PoolEntry {
    client: Arc<dyn ClusterClient>,
    refs: usize,
}

pub struct RemoteClientPool {
    factory: Arc<dyn ClientFactory>,
    rpc_timeout: Duration,
    entries: Mutex<HashMap<String, PoolEntry>>,
    /// Set by `drain` under the entries lock; no client is created afterwards
    closed: AtomicBool,
    /// Clusters already reported at warn level for missing endpoints
    warned: Mutex<HashSet<String>>,
}

impl RemoteClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, rpc_timeout: Duration) -> Self {
        Self {
            factory,
            rpc_timeout,
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            warned: Mutex::new(HashSet::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a reference to the client of `cluster_id`, building it on first use.
    ///
    /// Fails with [`CdcError::Configuration`] while the registry has no
    /// endpoints for the cluster and with [`CdcError::Connect`] when the build
    /// fails. Neither leaves anything cached. Once the pool is drained every
    /// call fails with [`CdcError::ShuttingDown`].
    pub fn get_or_create(&self, cluster_id: &str, registry: &Registry) -> Result<RemoteClientHandle> {
        if let Some(handle) = self.acquire_existing(cluster_id) {
            return Ok(handle);
        }
        if self.is_closed() {
            return Err(CdcError::ShuttingDown);
        }

        let Some(endpoints) = registry.endpoints(cluster_id) else {
            rly_metrics::increment_configuration_errors();
            let first = self
                .warned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(cluster_id.to_string());
            if first {
                warn!(
                    target: "relay::pool",
                    cluster = %cluster_id,
                    "No endpoints known for producer cluster yet, will retry"
                );
            } else {
                debug!(
                    target: "relay::pool",
                    cluster = %cluster_id,
                    "Still no endpoints for producer cluster"
                );
            }
            return Err(CdcError::Configuration {
                cluster_id: cluster_id.to_string(),
            });
        };

        // build without holding the pool lock; construction may block
        let options = ClientOptions::new(endpoints, format!("cdc-consumer-{cluster_id}"))
            .with_rpc_timeout(self.rpc_timeout);
        let client = self.factory.build(options).map_err(|source| {
            rly_metrics::increment_connect_errors();
            warn!(
                target: "relay::pool",
                cluster = %cluster_id,
                error = %source,
                "Failed to build producer cluster client"
            );
            CdcError::Connect {
                cluster_id: cluster_id.to_string(),
                source,
            }
        })?;
        self.warned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cluster_id);

        let (handle, redundant) = {
            let mut entries = self.entries();
            if self.is_closed() {
                drop(entries);
                client.shutdown();
                debug!(
                    target: "relay::pool",
                    cluster = %cluster_id,
                    "Pool drained during client build, discarding client"
                );
                return Err(CdcError::ShuttingDown);
            }
            match entries.get_mut(cluster_id) {
                Some(entry) => {
                    entry.refs += 1;
                    let handle = RemoteClientHandle {
                        cluster_id: cluster_id.to_string(),
                        client: Arc::clone(&entry.client),
                    };
                    (handle, Some(client))
                },
                None => {
                    entries.insert(
                        cluster_id.to_string(),
                        PoolEntry {
                            client: Arc::clone(&client),
                            refs: 1,
                        },
                    );
                    let handle = RemoteClientHandle {
                        cluster_id: cluster_id.to_string(),
                        client,
                    };
                    (handle, None)
                },
            }
        };

        match redundant {
            Some(client) => client.shutdown(),
            None => {
                rly_metrics::remote_client_created();
                info!(
                    target: "relay::pool",
                    cluster = %cluster_id,
                    "Created producer cluster client"
                );
            },
        }
        Ok(handle)
    }

    fn acquire_existing(&self, cluster_id: &str) -> Option<RemoteClientHandle> {
        let mut entries = self.entries();
        let entry = entries.get_mut(cluster_id)?;
        entry.refs += 1;
        Some(RemoteClientHandle {
            cluster_id: cluster_id.to_string(),
            client: Arc::clone(&entry.client),
        })
    }

    /// Drop one reference. When it was the last and the registry no longer
    /// lists the cluster, the client is removed and returned for shutdown.
    pub fn release(&self, cluster_id: &str, registry: &Registry) -> Option<EvictedClient> {
        let listed = registry.lists_cluster(cluster_id);
        let mut entries = self.entries();
        let entry = entries.get_mut(cluster_id)?;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 || listed {
            return None;
        }
        entries.remove(cluster_id).map(|entry| EvictedClient {
            cluster_id: cluster_id.to_string(),
            client: entry.client,
        })
    }

    /// Remove every unreferenced client whose cluster the registry no longer lists.
    pub fn sweep(&self, registry: &Registry) -> Vec<EvictedClient> {
        let candidates: Vec<String> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.refs == 0)
            .map(|(cluster_id, _)| cluster_id.clone())
            .collect();
        let unlisted: Vec<String> = candidates
            .into_iter()
            .filter(|cluster_id| !registry.lists_cluster(cluster_id))
            .collect();
        if unlisted.is_empty() {
            return Vec::new();
        }

        let mut entries = self.entries();
        unlisted
            .into_iter()
            .filter_map(|cluster_id| {
                // a poller may have taken a reference since the first pass
                if entries.get(&cluster_id).is_some_and(|e| e.refs == 0) {
                    entries.remove(&cluster_id).map(|entry| EvictedClient {
                        cluster_id,
                        client: entry.client,
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Remove every client regardless of references and refuse new ones.
    pub fn drain(&self) -> Vec<EvictedClient> {
        let mut entries = self.entries();
        self.closed.store(true, Ordering::Release);
        entries
            .drain()
            .map(|(cluster_id, entry)| EvictedClient {
                cluster_id,
                client: entry.client,
            })
            .collect()
    }

    pub fn ref_count(&self, cluster_id: &str) -> Option<usize> {
        self.entries().get(cluster_id).map(|entry| entry.refs)
    }

    /// Ids of clusters with a live client, sorted.
    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
