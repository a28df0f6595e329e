//! Cross-instance save awareness.
//!
//! Instances sharing a directory announce save starts, completions and
//! failures over a publish/subscribe channel, tagged with the sender's
//! identity. The bus provides awareness only, never arbitration: two
//! instances can still race on a write, and the underlying host write stays
//! last-writer-wins.

use crate::core::InstanceId;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum SaveEvent {
    Started,
    Completed { timestamp: DateTime<Utc> },
    Failed { kind: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveBroadcast {
    pub instance: InstanceId,
    pub event: SaveEvent,
}

/// Cloneable handle to the inter-instance channel. All coordinators sharing
/// a directory should be handed clones of the same bus.
#[derive(Clone)]
pub struct SaveBus {
    tx: broadcast::Sender<SaveBroadcast>,
}

impl SaveBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Fire-and-forget publish; a bus with no listeners is not an error.
    pub fn publish(&self, instance: InstanceId, event: SaveEvent) {
        let _ = self.tx.send(SaveBroadcast { instance, event });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveBroadcast> {
        self.tx.subscribe()
    }
}

impl Default for SaveBus {
    fn default() -> Self {
        Self::new()
    }
}
