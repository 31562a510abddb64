#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod error;
mod hlc;
mod record;
mod tablet;

pub use error::{RelayError, Result};
pub use hlc::{HlcTimestamp, HybridLogicalClock};
pub use record::{ChangeRecord, ColumnValue, OpId, RecordKind, TransactionId};
pub use tablet::{ConsumerTabletInfo, ProducerTabletInfo};

/// Default RPC timeout applied to every client built for a producer cluster.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;

/// Default delay between two poll cycles of a single producer tablet.
pub const DEFAULT_POLL_DELAY_MS: u64 = 1_000;

/// Default period of the consumer trigger loop.
pub const DEFAULT_TRIGGER_INTERVAL_MS: u64 = 1_000;
