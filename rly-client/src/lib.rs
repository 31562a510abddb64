#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod client;
mod error;
pub mod memory;

pub use client::{
    ClientFactory, ClientOptions, ClusterClient, GetChangesRequest, GetChangesResponse,
    TransactionStatus, TransactionUpdate, WriteBatch, WriteColumn, WriteKind, WriteOp,
};
pub use error::{ClientError, Result};
pub use memory::{MemoryClient, MemoryClientFactory, MemoryCluster, StoredValue};
