//! Turns fetched change records into writes on the local cluster.

use rly_client::{
    ClusterClient, TransactionStatus, TransactionUpdate, WriteBatch, WriteColumn, WriteKind,
    WriteOp,
};
use rly_core::{ChangeRecord, HybridLogicalClock, OpId, RecordKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::ApplyError;

/// What to do with a record that cannot be turned into a local write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadRecordPolicy {
    /// Log it, step over it and keep replicating the tablet.
    #[default]
    Skip,
    /// Apply everything before it, then stop at it on every cycle until an
    /// operator fixes the stream.
    Halt,
}

impl std::str::FromStr for BadRecordPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "halt" => Ok(Self::Halt),
            other => Err(format!("unknown bad record policy: {other}")),
        }
    }
}

/// Producer schema version -> consumer schema version for one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaVersionMap(HashMap<u32, u32>);

impl SchemaVersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, producer: u32, consumer: u32) {
        self.0.insert(producer, consumer);
    }

    pub fn translate(&self, producer: u32) -> Option<u32> {
        self.0.get(&producer).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(u32, u32)> for SchemaVersionMap {
    fn from_iter<I: IntoIterator<Item = (u32, u32)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-cycle apply settings of one producer tablet, read from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecordInfo {
    pub consumer_tablet_id: String,
    /// Transaction boundaries go to the status tablet
    pub transactional: bool,
    pub status_tablet_id: Option<String>,
    pub schema_versions: Arc<SchemaVersionMap>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Records written or routed to a status tablet
    pub applied: usize,
    /// Malformed records stepped over
    pub skipped: usize,
    /// Last record consumed, applied or skipped
    pub last_op_id: Option<OpId>,
}

/// Applies record batches for any number of tablets through the local client.
pub struct ApplyPipeline {
    local: Arc<dyn ClusterClient>,
    clock: Arc<HybridLogicalClock>,
    policy: BadRecordPolicy,
}

impl ApplyPipeline {
    pub fn new(
        local: Arc<dyn ClusterClient>,
        clock: Arc<HybridLogicalClock>,
        policy: BadRecordPolicy,
    ) -> Self {
        Self {
            local,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> BadRecordPolicy {
        self.policy
    }

    /// Apply `records` in order to the consumer tablet named by `info`.
    ///
    /// A schema version mismatch anywhere in the batch fails it before the
    /// first write. Every other failure leaves earlier records applied;
    /// since writes are keyed by `(key, write_time)`, replaying them is an
    /// overwrite with identical values.
    pub async fn apply(
        &self,
        records: &[ChangeRecord],
        info: &ProcessRecordInfo,
    ) -> Result<ApplyOutcome, ApplyError> {
        check_schema_versions(records, info)?;

        let mut outcome = ApplyOutcome::default();
        let mut pending = WriteBatch::new(&info.consumer_tablet_id);

        for record in records {
            if let Some(reason) = malformed(record, info) {
                match self.policy {
                    BadRecordPolicy::Skip => {
                        error!(
                            target: "relay::apply",
                            tablet = %info.consumer_tablet_id,
                            op_id = %record.op_id,
                            reason,
                            "Skipping malformed record"
                        );
                        outcome.skipped += 1;
                        outcome.last_op_id = Some(record.op_id);
                        continue;
                    },
                    BadRecordPolicy::Halt => {
                        self.flush(&mut pending).await?;
                        rly_metrics::increment_records_applied(outcome.applied as u64);
                        error!(
                            target: "relay::apply",
                            tablet = %info.consumer_tablet_id,
                            op_id = %record.op_id,
                            reason,
                            "Halting tablet at malformed record"
                        );
                        return Err(ApplyError::MalformedRecord {
                            op_id: record.op_id,
                            reason: reason.to_string(),
                            applied_through: outcome.last_op_id,
                        });
                    },
                }
            }

            self.clock.update(record.write_time);

            if info.transactional && record.kind.is_transaction_boundary() {
                // status updates must not overtake the writes before them
                self.flush(&mut pending).await?;
                match record.kind {
                    RecordKind::TransactionCreate => self.process_create_record(record, info).await?,
                    _ => self.process_commit_record(record, info).await?,
                }
            } else if let Some(op) = self.process_record(record, info) {
                pending.ops.push(op);
            }

            outcome.applied += 1;
            outcome.last_op_id = Some(record.op_id);
        }

        self.flush(&mut pending).await?;

        rly_metrics::increment_records_applied(outcome.applied as u64);
        rly_metrics::increment_records_skipped(outcome.skipped as u64);
        Ok(outcome)
    }

    /// Local write for a standalone mutation; `None` for records that carry none.
    ///
    /// Column versions must already be known to translate.
    pub fn process_record(&self, record: &ChangeRecord, info: &ProcessRecordInfo) -> Option<WriteOp> {
        let kind = match record.kind {
            RecordKind::Write => WriteKind::Put {
                columns: record
                    .columns
                    .iter()
                    .map(|column| WriteColumn {
                        column_id: column.column_id,
                        schema_version: info
                            .schema_versions
                            .translate(column.schema_version)
                            .unwrap_or(column.schema_version),
                        value: column.value.clone(),
                    })
                    .collect(),
            },
            RecordKind::Delete => WriteKind::Delete,
            RecordKind::TransactionCreate | RecordKind::TransactionCommit => return None,
        };

        Some(WriteOp {
            key: record.key.clone(),
            write_time: record.write_time,
            kind,
            transaction_id: if info.transactional {
                record.transaction_id
            } else {
                None
            },
        })
    }

    /// Register a replicated transaction as pending on the status tablet.
    pub async fn process_create_record(
        &self,
        record: &ChangeRecord,
        info: &ProcessRecordInfo,
    ) -> Result<(), ApplyError> {
        self.update_status(record, info, TransactionStatus::Pending)
            .await
    }

    /// Mark a replicated transaction committed at the producer commit time.
    pub async fn process_commit_record(
        &self,
        record: &ChangeRecord,
        info: &ProcessRecordInfo,
    ) -> Result<(), ApplyError> {
        self.update_status(
            record,
            info,
            TransactionStatus::Committed {
                commit_time: record.write_time,
            },
        )
        .await
    }

    async fn update_status(
        &self,
        record: &ChangeRecord,
        info: &ProcessRecordInfo,
        status: TransactionStatus,
    ) -> Result<(), ApplyError> {
        let status_tablet_id =
            info.status_tablet_id
                .clone()
                .ok_or_else(|| ApplyError::MissingStatusTablet {
                    tablet: info.consumer_tablet_id.clone(),
                    op_id: record.op_id,
                })?;
        let Some(transaction_id) = record.transaction_id else {
            // rejected by `malformed` before we get here
            return Ok(());
        };

        debug!(
            target: "relay::apply",
            status_tablet = %status_tablet_id,
            transaction_id,
            ?status,
            "Updating replicated transaction status"
        );
        self.local
            .update_transaction(TransactionUpdate {
                status_tablet_id: status_tablet_id.clone(),
                transaction_id,
                status,
                involved_tablet_id: info.consumer_tablet_id.clone(),
            })
            .await
            .map_err(|source| ApplyError::Write {
                tablet: status_tablet_id,
                source,
            })
    }

    async fn flush(&self, pending: &mut WriteBatch) -> Result<(), ApplyError> {
        if pending.is_empty() {
            return Ok(());
        }
        let tablet = pending.tablet_id.clone();
        let batch = std::mem::replace(pending, WriteBatch::new(tablet.clone()));
        self.local
            .write(batch)
            .await
            .map_err(|source| ApplyError::Write { tablet, source })
    }
}

fn check_schema_versions(records: &[ChangeRecord], info: &ProcessRecordInfo) -> Result<(), ApplyError> {
    let unknown = records
        .iter()
        .flat_map(|record| record.columns.iter())
        .find(|column| info.schema_versions.translate(column.schema_version).is_none());

    match unknown {
        Some(column) => Err(ApplyError::SchemaVersionMismatch {
            tablet: info.consumer_tablet_id.clone(),
            producer_version: column.schema_version,
        }),
        None => Ok(()),
    }
}

fn malformed(record: &ChangeRecord, info: &ProcessRecordInfo) -> Option<&'static str> {
    match record.kind {
        RecordKind::Write if record.key.is_empty() => Some("write without key"),
        RecordKind::Write if record.columns.is_empty() => Some("write without columns"),
        RecordKind::Delete if record.key.is_empty() => Some("delete without key"),
        RecordKind::TransactionCreate | RecordKind::TransactionCommit
            if info.transactional && record.transaction_id.is_none() =>
        {
            Some("transaction boundary without transaction id")
        },
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rly_client::{MemoryClient, MemoryCluster};
    use rly_core::{ColumnValue, HlcTimestamp};

    fn ts(ms: u64) -> HlcTimestamp {
        HlcTimestamp::new(ms, 0)
    }

    fn write(index: u64, key: &str, version: u32, value: &str) -> ChangeRecord {
        ChangeRecord::write(
            OpId::new(1, index),
            key.to_string(),
            vec![ColumnValue::new(1, version, value.to_string())],
            ts(1_000 + index),
        )
    }

    fn info(versions: &[(u32, u32)]) -> ProcessRecordInfo {
        ProcessRecordInfo {
            consumer_tablet_id: "ct1".into(),
            transactional: false,
            status_tablet_id: None,
            schema_versions: Arc::new(versions.iter().copied().collect()),
        }
    }

    fn pipeline(policy: BadRecordPolicy) -> (Arc<MemoryCluster>, ApplyPipeline, Arc<HybridLogicalClock>) {
        let cluster = MemoryCluster::new("local");
        let clock = Arc::new(HybridLogicalClock::new());
        let local = Arc::new(MemoryClient::new("local", Arc::clone(&cluster)));
        (cluster, ApplyPipeline::new(local, Arc::clone(&clock), policy), clock)
    }

    #[tokio::test]
    async fn test_applies_in_order_with_translated_versions() {
        let (cluster, pipeline, clock) = pipeline(BadRecordPolicy::Skip);
        let records = vec![
            write(1, "a", 6, "1"),
            write(2, "b", 6, "2"),
            ChangeRecord::delete(OpId::new(1, 3), "a", ts(1_003)),
        ];

        let outcome = pipeline.apply(&records, &info(&[(6, 2)])).await.unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.last_op_id, Some(OpId::new(1, 3)));
        assert!(cluster.read("ct1", b"a").is_none());
        let b = cluster.read("ct1", b"b").unwrap();
        assert_eq!(b[0].schema_version, 2);
        assert_eq!(b[0].value, Bytes::from("2"));
        assert_eq!(cluster.write_batches(), 1);
        assert!(clock.current() >= ts(1_003));
    }

    #[tokio::test]
    async fn test_schema_mismatch_writes_nothing() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        let records = vec![write(1, "a", 6, "1"), write(2, "b", 7, "2")];

        let err = pipeline.apply(&records, &info(&[(6, 1)])).await.unwrap_err();

        assert_eq!(
            err,
            ApplyError::SchemaVersionMismatch {
                tablet: "ct1".into(),
                producer_version: 7
            }
        );
        assert!(err.is_retryable());
        assert_eq!(cluster.write_batches(), 0);
        assert_eq!(cluster.row_count("ct1"), 0);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        let records = vec![write(1, "a", 6, "1"), write(2, "a", 6, "2")];
        let info = info(&[(6, 1)]);

        pipeline.apply(&records, &info).await.unwrap();
        pipeline.apply(&records, &info).await.unwrap();

        assert_eq!(cluster.version_count("ct1", b"a"), 2);
        assert_eq!(cluster.read("ct1", b"a").unwrap()[0].value, Bytes::from("2"));
    }

    #[tokio::test]
    async fn test_skip_policy_steps_over_bad_record() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        assert_eq!(pipeline.policy(), BadRecordPolicy::Skip);
        let records = vec![
            write(1, "a", 6, "1"),
            ChangeRecord::write(OpId::new(1, 2), Bytes::new(), vec![], ts(1_002)),
            write(3, "c", 6, "3"),
        ];

        let outcome = pipeline.apply(&records, &info(&[(6, 1)])).await.unwrap();

        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.last_op_id, Some(OpId::new(1, 3)));
        assert!(cluster.read("ct1", b"c").is_some());
    }

    #[tokio::test]
    async fn test_halt_policy_applies_prefix_and_stops() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Halt);
        assert_eq!(pipeline.policy(), BadRecordPolicy::Halt);
        let records = vec![
            write(1, "a", 6, "1"),
            ChangeRecord::delete(OpId::new(1, 2), Bytes::new(), ts(1_002)),
            write(3, "c", 6, "3"),
        ];

        let err = pipeline.apply(&records, &info(&[(6, 1)])).await.unwrap_err();

        assert!(!err.is_retryable());
        assert_eq!(err.applied_through(), Some(OpId::new(1, 1)));
        assert!(cluster.read("ct1", b"a").is_some());
        assert!(cluster.read("ct1", b"c").is_none());
    }

    #[tokio::test]
    async fn test_local_write_failure_is_retryable() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        cluster.fail_next_writes(1);

        let err = pipeline
            .apply(&[write(1, "a", 6, "1")], &info(&[(6, 1)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ApplyError::Write { .. }));
        assert!(err.is_retryable());
        assert_eq!(cluster.row_count("ct1"), 0);
    }

    #[tokio::test]
    async fn test_transaction_boundaries_update_status_tablet() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        let mut info = info(&[(6, 1)]);
        info.transactional = true;
        info.status_tablet_id = Some("status-1".into());

        let records = vec![
            ChangeRecord::transaction_create(OpId::new(1, 1), 42, ts(1_001)),
            write(2, "a", 6, "1").in_transaction(42),
            ChangeRecord::transaction_commit(OpId::new(1, 3), 42, ts(1_005)),
        ];
        let outcome = pipeline.apply(&records, &info).await.unwrap();

        assert_eq!(outcome.applied, 3);
        let update = cluster.transaction("status-1", 42).unwrap();
        assert_eq!(
            update.status,
            TransactionStatus::Committed {
                commit_time: ts(1_005)
            }
        );
        assert_eq!(update.involved_tablet_id, "ct1");
        assert_eq!(cluster.applied_keys("ct1"), vec![Bytes::from("a")]);
    }

    #[tokio::test]
    async fn test_boundary_without_status_tablet() {
        let (_, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        let mut info = info(&[]);
        info.transactional = true;

        let err = pipeline
            .apply(
                &[ChangeRecord::transaction_create(OpId::new(1, 1), 42, ts(1))],
                &info,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ApplyError::MissingStatusTablet { .. }));
    }

    #[tokio::test]
    async fn test_boundaries_ignored_when_not_transactional() {
        let (cluster, pipeline, _) = pipeline(BadRecordPolicy::Skip);
        let records = vec![
            ChangeRecord::transaction_create(OpId::new(1, 1), 42, ts(1)),
            write(2, "a", 6, "1").in_transaction(42),
        ];

        let outcome = pipeline.apply(&records, &info(&[(6, 1)])).await.unwrap();

        assert_eq!(outcome.last_op_id, Some(OpId::new(1, 2)));
        assert!(cluster.transaction("status-1", 42).is_none());
        assert!(cluster.read("ct1", b"a").is_some());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("halt".parse::<BadRecordPolicy>().unwrap(), BadRecordPolicy::Halt);
        assert_eq!("Skip".parse::<BadRecordPolicy>().unwrap(), BadRecordPolicy::Skip);
        assert!("drop".parse::<BadRecordPolicy>().is_err());
    }
}
