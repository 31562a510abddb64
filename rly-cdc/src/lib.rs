#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

//! Cross-cluster CDC replication consumer.
//!
//! A [`CdcConsumer`] receives [`ConsumerRegistry`] snapshots from the control
//! plane, starts one poller per producer tablet whose consumer tablet this
//! node leads, and applies the fetched change records to the local cluster.

mod apply;
mod checkpoint;
mod client_pool;
mod config;
mod coordinator;
mod error;
mod poller;
mod registry;

pub use apply::{ApplyOutcome, ApplyPipeline, BadRecordPolicy, ProcessRecordInfo, SchemaVersionMap};
pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use client_pool::{EvictedClient, RemoteClientHandle, RemoteClientPool};
pub use config::ConsumerConfig;
pub use coordinator::{CdcConsumer, ConsumerDeps, ConsumerState, TabletLeadership};
pub use error::{ApplyError, CdcError, Result};
pub use poller::{PollerInfo, PollerState, PollerStatus};
pub use registry::{
    ConsumerRegistry, ProducerEntry, RefreshOutcome, Registry, SchemaVersionPair, StreamEntry,
};
