//! Last processed record per producer tablet.
//!
//! The consumer saves a checkpoint after every successful apply and loads it
//! when a poller for the same tablet is created again (for example after
//! leadership of the consumer tablet moves away and back).

use rly_core::{OpId, ProducerTabletInfo, RelayError, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub trait CheckpointStore: Send + Sync {
    /// `None` when the tablet has never been applied.
    fn load(&self, key: &ProducerTabletInfo) -> Result<Option<OpId>>;

    fn save(&self, key: &ProducerTabletInfo, op_id: OpId) -> Result<()>;
}

/// Checkpoints that live as long as the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    checkpoints: Arc<RwLock<HashMap<ProducerTabletInfo, OpId>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(e: impl std::fmt::Display) -> RelayError {
    RelayError::Internal(format!("Lock poisoned: {}", e))
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &ProducerTabletInfo) -> Result<Option<OpId>> {
        let checkpoints = self.checkpoints.read().map_err(poisoned)?;
        Ok(checkpoints.get(key).copied())
    }

    fn save(&self, key: &ProducerTabletInfo, op_id: OpId) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().map_err(poisoned)?;
        // never move a tablet backwards
        let entry = checkpoints.entry(key.clone()).or_insert(op_id);
        if op_id > *entry {
            *entry = op_id;
        }
        Ok(())
    }
}
