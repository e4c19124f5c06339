use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed for one tenant's slot table. Only committed events are sent.
pub struct NotifyHub {
    sender: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// A lagging subscriber gets `RecvError::Lagged` and should re-read the table.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.sender.send(event.clone());
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
