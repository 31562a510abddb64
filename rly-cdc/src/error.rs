use rly_client::ClientError;
use rly_core::OpId;
use thiserror::Error;

/// Failure of one apply cycle for a consumer tablet.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApplyError {
    /// A column was written under a producer schema version that the stream's
    /// version map does not translate. Nothing from the batch was applied.
    #[error("schema version mismatch on {tablet}: producer version {producer_version} has no mapping")]
    SchemaVersionMismatch {
        tablet: String,
        producer_version: u32,
    },

    /// The record cannot be turned into a local write. Records before it were
    /// applied up to `applied_through`.
    #[error("malformed record {op_id}: {reason}")]
    MalformedRecord {
        op_id: OpId,
        reason: String,
        applied_through: Option<OpId>,
    },

    #[error("transaction boundary {op_id} on {tablet} with no transaction status tablet")]
    MissingStatusTablet { tablet: String, op_id: OpId },

    #[error("local write to {tablet} failed: {source}")]
    Write {
        tablet: String,
        #[source]
        source: ClientError,
    },
}

impl ApplyError {
    /// Whether replaying the same records later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SchemaVersionMismatch { .. } | Self::MissingStatusTablet { .. } => true,
            Self::Write { source, .. } => source.is_retryable(),
            Self::MalformedRecord { .. } => false,
        }
    }

    /// Last record that made it into local storage before the failure.
    pub fn applied_through(&self) -> Option<OpId> {
        match self {
            Self::MalformedRecord {
                applied_through, ..
            } => *applied_through,
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CdcError {
    /// Endpoints for the producer cluster are not known yet; retried next pass.
    #[error("no endpoints known for producer cluster {cluster_id}")]
    Configuration { cluster_id: String },

    #[error("failed to connect to producer cluster {cluster_id}: {source}")]
    Connect {
        cluster_id: String,
        #[source]
        source: ClientError,
    },

    #[error("fetch from {tablet} failed: {source}")]
    Fetch {
        tablet: String,
        #[source]
        source: ClientError,
    },

    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// The local cluster client could not be constructed. Fatal at creation.
    #[error("failed to create local client: {0}")]
    LocalClient(#[source] ClientError),

    #[error("failed to start consumer runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("consumer is shutting down")]
    ShuttingDown,
}

impl CdcError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration { .. } | Self::Connect { .. } | Self::Fetch { .. } => true,
            Self::Apply(err) => err.is_retryable(),
            Self::LocalClient(_) | Self::Runtime(_) | Self::ShuttingDown => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
