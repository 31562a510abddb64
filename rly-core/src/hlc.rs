//! Hybrid time for replicated writes.
//!
//! Every change record carries the producer's hybrid timestamp of the write.
//! The consumer folds those timestamps into its own clock so that local reads
//! issued after an apply never observe a time earlier than the replicated data.
//!
//! A timestamp is a packed `u64`: the upper 44 bits hold physical milliseconds
//! since the Unix epoch, the lower 20 bits a logical counter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HlcTimestamp(u64);

impl HlcTimestamp {
    const LOGICAL_BITS: u32 = 20;
    const LOGICAL_MASK: u64 = (1 << Self::LOGICAL_BITS) - 1;

    pub const MAX_LOGICAL: u32 = (1 << Self::LOGICAL_BITS) - 1;

    #[inline]
    #[must_use]
    pub const fn new(physical_ms: u64, logical: u32) -> Self {
        debug_assert!(logical <= Self::MAX_LOGICAL);
        Self((physical_ms << Self::LOGICAL_BITS) | (logical as u64))
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn physical_ms(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    #[inline]
    #[must_use]
    pub const fn logical(&self) -> u32 {
        (self.0 & Self::LOGICAL_MASK) as u32
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Smallest timestamp greater than `self`. An exhausted logical counter
    /// rolls over into the next millisecond.
    #[inline]
    #[must_use]
    pub const fn successor(&self) -> Self {
        if self.logical() < Self::MAX_LOGICAL {
            Self::new(self.physical_ms(), self.logical() + 1)
        } else {
            Self::new(self.physical_ms() + 1, 0)
        }
    }
}

impl std::fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.physical_ms(), self.logical())
    }
}

/// Lock-free hybrid logical clock.
///
/// ```
/// use rly_core::{HlcTimestamp, HybridLogicalClock};
///
/// let clock = HybridLogicalClock::new();
/// let remote = HlcTimestamp::new(u64::from(u32::MAX) * 1_000, 7);
/// let local = clock.update(remote);
/// assert!(local > remote);
/// assert!(clock.now() > local);
/// ```
#[derive(Default)]
pub struct HybridLogicalClock {
    last: AtomicU64,
}

impl HybridLogicalClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp for a local event. Strictly greater than every timestamp
    /// previously returned by this clock.
    pub fn now(&self) -> HlcTimestamp {
        self.advance(|last, wall| {
            if wall > last.physical_ms() {
                HlcTimestamp::new(wall, 0)
            } else {
                last.successor()
            }
        })
    }

    /// Fold a remote timestamp into the clock, returning a local timestamp
    /// greater than both the previous local time and `remote`.
    pub fn update(&self, remote: HlcTimestamp) -> HlcTimestamp {
        self.advance(|last, wall| {
            let floor = last.max(remote);
            if wall > floor.physical_ms() {
                HlcTimestamp::new(wall, 0)
            } else {
                floor.successor()
            }
        })
    }

    /// Last issued timestamp, without advancing.
    #[inline]
    #[must_use]
    pub fn current(&self) -> HlcTimestamp {
        HlcTimestamp(self.last.load(Ordering::Acquire))
    }

    fn advance(&self, step: impl Fn(HlcTimestamp, u64) -> HlcTimestamp) -> HlcTimestamp {
        loop {
            let last = HlcTimestamp(self.last.load(Ordering::Acquire));
            let next = step(last, wall_clock_ms());
            if self
                .last
                .compare_exchange_weak(last.0, next.0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return next;
            }
        }
    }
}

impl std::fmt::Debug for HybridLogicalClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridLogicalClock")
            .field("current", &self.current())
            .finish()
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
