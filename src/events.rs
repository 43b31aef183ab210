//! Post-commit event bus.
//!
//! The index engine publishes events after each committed mutation; interested
//! subsystems (the search cache, source maintenance) subscribe. Publishers
//! hold no references to subscribers, which keeps the index free of cycles.

use crate::core::{PartitionKey, TimeRange};
use tokio::sync::broadcast;

/// Events emitted by the index after state changes become visible.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    /// A batch became visible to readers in the given partition.
    BatchCommitted {
        partition: PartitionKey,
        range: TimeRange,
        count: usize,
    },
    /// Entries were deleted from a partition.
    EntriesDeleted {
        partition: PartitionKey,
    },
    /// A partition left hot storage (archived or deleted).
    PartitionRemoved {
        partition: PartitionKey,
    },
}

impl IndexEvent {
    pub fn partition(&self) -> &PartitionKey {
        match self {
            Self::BatchCommitted { partition, .. }
            | Self::EntriesDeleted { partition }
            | Self::PartitionRemoved { partition } => partition,
        }
    }
}

/// Broadcast bus for index events. Cloning shares the underlying channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, event: IndexEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
