//! The client seam between the replication consumer and a database cluster.
//!
//! One trait covers both directions: against a producer cluster the consumer
//! only calls [`ClusterClient::get_changes`]; against the local cluster it
//! calls [`ClusterClient::write`] and [`ClusterClient::update_transaction`].

use bytes::Bytes;
use futures::future::BoxFuture;
use rly_core::{ChangeRecord, HlcTimestamp, OpId, TransactionId};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Options handed to a [`ClientFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// `host:port` of the cluster's masters
    pub master_addresses: Vec<String>,
    /// Diagnostic name of the connection
    pub client_name: String,
    /// Deadline applied to every RPC issued by the client
    pub default_rpc_timeout: Duration,
}

impl ClientOptions {
    pub fn new(master_addresses: Vec<String>, client_name: impl Into<String>) -> Self {
        Self {
            master_addresses,
            client_name: client_name.into(),
            default_rpc_timeout: Duration::from_secs(rly_core::DEFAULT_RPC_TIMEOUT_SECS),
        }
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.default_rpc_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChangesRequest {
    pub stream_id: String,
    pub tablet_id: String,
    /// Return records strictly after this position
    pub from_op_id: OpId,
    pub max_records: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetChangesResponse {
    /// Records in producer log order
    pub records: Vec<ChangeRecord>,
    /// Last op id the producer has written for the tablet, if known
    pub producer_tail: Option<OpId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteKind {
    Put { columns: Vec<WriteColumn> },
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteColumn {
    pub column_id: u32,
    /// Consumer-side schema version
    pub schema_version: u32,
    pub value: Bytes,
}

/// A single keyed mutation.
///
/// Storage applies it at most once per `(key, write_time)`; a repeated op is
/// an overwrite with the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub key: Bytes,
    pub write_time: HlcTimestamp,
    pub kind: WriteKind,
    /// Set when the write is a provisional record of a replicated transaction
    pub transaction_id: Option<TransactionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub tablet_id: String,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new(tablet_id: impl Into<String>) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Committed { commit_time: HlcTimestamp },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionUpdate {
    pub status_tablet_id: String,
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    /// Consumer tablet that holds provisional writes of the transaction
    pub involved_tablet_id: String,
}

pub trait ClusterClient: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch change records of one producer tablet.
    fn get_changes(&self, request: GetChangesRequest) -> BoxFuture<'_, Result<GetChangesResponse>>;

    /// Apply a batch of mutations to a local tablet.
    fn write(&self, batch: WriteBatch) -> BoxFuture<'_, Result<()>>;

    /// Record a transaction status change on a transaction status tablet.
    fn update_transaction(&self, update: TransactionUpdate) -> BoxFuture<'_, Result<()>>;

    /// Close connections. Calls in flight and every later call fail with
    /// [`ClientError::Shutdown`](crate::ClientError::Shutdown). May block.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;
}

/// Builds long-lived cluster clients.
pub trait ClientFactory: Send + Sync {
    fn build(&self, options: ClientOptions) -> Result<Arc<dyn ClusterClient>>;
}
