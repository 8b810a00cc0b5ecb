use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-product change feed. Downstream collaborators (mailers, caches)
/// subscribe here instead of polling the store.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, product_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(product_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, product_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&product_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune_idle(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
