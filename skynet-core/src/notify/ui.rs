//! In-process notification feed for UI readers
//!
//! A [`tokio::sync::broadcast`] channel: every reader sees every item sent
//! after it subscribed. A reader that falls behind loses the oldest items
//! (`RecvError::Lagged`); it never slows the sender.

use super::broadcast::Subscriber;
use crate::config::UI_CHANNEL;
use crate::error::Result;
use crate::types::Notification;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// The `ui` channel
pub struct UiFeed {
    sender: broadcast::Sender<Notification>,
}

impl UiFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// A new reader, starting at the next notification
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    pub fn reader_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl Subscriber for UiFeed {
    fn name(&self) -> &str {
        UI_CHANNEL
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        // Nobody listening is still a delivery: the feed has no backlog to fill
        if self.sender.send(notification.clone()).is_err() {
            tracing::trace!(event_key = %notification.event_key, "No UI readers");
        }
        Ok(())
    }
}
