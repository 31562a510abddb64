use serde::{Deserialize, Serialize};
use std::fmt;

/// Source of replicated data: one tablet of one stream on a producer cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProducerTabletInfo {
    pub producer_cluster_id: String,
    pub stream_id: String,
    pub producer_tablet_id: String,
}

impl ProducerTabletInfo {
    pub fn new(
        producer_cluster_id: impl Into<String>,
        stream_id: impl Into<String>,
        producer_tablet_id: impl Into<String>,
    ) -> Self {
        Self {
            producer_cluster_id: producer_cluster_id.into(),
            stream_id: stream_id.into(),
            producer_tablet_id: producer_tablet_id.into(),
        }
    }
}

impl fmt::Display for ProducerTabletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.producer_cluster_id, self.stream_id, self.producer_tablet_id
        )
    }
}

/// Local target of replication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConsumerTabletInfo {
    pub consumer_tablet_id: String,
    pub consumer_table_id: String,
}

impl ConsumerTabletInfo {
    pub fn new(consumer_tablet_id: impl Into<String>, consumer_table_id: impl Into<String>) -> Self {
        Self {
            consumer_tablet_id: consumer_tablet_id.into(),
            consumer_table_id: consumer_table_id.into(),
        }
    }
}

impl fmt::Display for ConsumerTabletInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.consumer_table_id, self.consumer_tablet_id)
    }
}
