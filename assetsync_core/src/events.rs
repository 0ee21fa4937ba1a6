use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::{api::AssetId, models::StatusChange};

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(StatusChange),
    DownloadProgress { id: AssetId, percent: u8 },
    UploadProgress { path: PathBuf, percent: u8 },
    BatchProgress { completed: usize, total: usize },
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
///
/// Publishing without subscribers is not an error. A subscriber that falls
/// more than the channel capacity behind skips the oldest events.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    /// Publishes the change returned by `Resource::set_status`, if any.
    pub fn status_changed(&self, change: Option<StatusChange>) {
        if let Some(change) = change {
            self.publish(SyncEvent::StatusChanged(change));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
