//! Change records pulled from a producer tablet.

use crate::hlc::HlcTimestamp;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a record in a producer tablet's log.
///
/// Ordered by `(term, index)`. The consumer treats it as opaque apart from
/// ordering: it is only ever handed back to the producer as "fetch after".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    /// Fetch position meaning "from the beginning of the stream".
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    #[inline]
    #[must_use]
    pub const fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

pub type TransactionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordKind {
    /// Upsert of the row at `key`.
    Write,
    /// Delete of the row at `key`.
    Delete,
    /// A distributed transaction started on the producer.
    TransactionCreate,
    /// A distributed transaction committed on the producer.
    TransactionCommit,
}

impl RecordKind {
    #[inline]
    #[must_use]
    pub const fn is_transaction_boundary(self) -> bool {
        matches!(self, Self::TransactionCreate | Self::TransactionCommit)
    }
}

/// One column value, tagged with the producer schema version it was written under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub column_id: u32,
    pub schema_version: u32,
    pub value: Bytes,
}

impl ColumnValue {
    pub fn new(column_id: u32, schema_version: u32, value: impl Into<Bytes>) -> Self {
        Self {
            column_id,
            schema_version,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op_id: OpId,
    pub kind: RecordKind,
    /// Document/row key. Empty for transaction boundary records.
    pub key: Bytes,
    pub columns: Vec<ColumnValue>,
    /// Producer hybrid time of the write; with `key` it identifies the mutation.
    pub write_time: HlcTimestamp,
    pub transaction_id: Option<TransactionId>,
}

impl ChangeRecord {
    pub fn write(
        op_id: OpId,
        key: impl Into<Bytes>,
        columns: Vec<ColumnValue>,
        write_time: HlcTimestamp,
    ) -> Self {
        Self {
            op_id,
            kind: RecordKind::Write,
            key: key.into(),
            columns,
            write_time,
            transaction_id: None,
        }
    }

    pub fn delete(op_id: OpId, key: impl Into<Bytes>, write_time: HlcTimestamp) -> Self {
        Self {
            op_id,
            kind: RecordKind::Delete,
            key: key.into(),
            columns: Vec::new(),
            write_time,
            transaction_id: None,
        }
    }

    #[must_use]
    pub fn transaction_create(op_id: OpId, txn: TransactionId, write_time: HlcTimestamp) -> Self {
        Self {
            op_id,
            kind: RecordKind::TransactionCreate,
            key: Bytes::new(),
            columns: Vec::new(),
            write_time,
            transaction_id: Some(txn),
        }
    }

    #[must_use]
    pub fn transaction_commit(op_id: OpId, txn: TransactionId, commit_time: HlcTimestamp) -> Self {
        Self {
            op_id,
            kind: RecordKind::TransactionCommit,
            key: Bytes::new(),
            columns: Vec::new(),
            write_time: commit_time,
            transaction_id: Some(txn),
        }
    }

    #[must_use]
    pub fn in_transaction(mut self, txn: TransactionId) -> Self {
        self.transaction_id = Some(txn);
        self
    }
}
