use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-venue broadcast of committed events, as JSON payloads.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<String>>,
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

    /// Subscribe to a venue's changes. Creates the channel if needed.
    pub fn subscribe(&self, venue_id: Ulid) -> broadcast::Receiver<String> {
        self.channels
            .entry(venue_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. A channel whose receivers are all gone
    /// is pruned.
    pub fn send(&self, event: &Event) {
        let venue_id = event.venue_id();
        let Some(sender) = self.channels.get(&venue_id) else {
            return;
        };
        if sender.receiver_count() == 0 {
            drop(sender);
            self.channels
                .remove_if(&venue_id, |_, sender| sender.receiver_count() == 0);
            return;
        }
        match serde_json::to_string(event) {
            Ok(payload) => {
                let _ = sender.send(payload);
            }
            Err(e) => tracing::warn!("dropping {} notification for {venue_id}: {e}", event.name()),
        }
    }

    pub fn remove(&self, venue_id: &Ulid) {
        self.channels.remove(venue_id);
    }
}
