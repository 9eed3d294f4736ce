//! In-process fan-out for applications (chat rooms, live feeds).
//!
//! Only reaches subscribers in this process. Fan-out across several server
//! processes needs an external message broker behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::gateway::event::Message;

pub trait Broadcaster: Send + Sync + 'static {
    /// Delivers `message` to every current subscriber of `channel`.
    /// Returns how many subscribers it reached.
    fn publish(&self, channel: &str, message: Message) -> usize;

    fn subscribe(&self, channel: &str) -> Subscription;
}

pub type SharedBroadcaster = Arc<dyn Broadcaster>;

type Channels = Mutex<HashMap<String, broadcast::Sender<Message>>>;

pub struct Subscription {
    rx: broadcast::Receiver<Message>,
    /// Where the channel is registered, so the last subscriber out removes it.
    registry: Option<(Weak<Channels>, String)>,
}

impl Subscription {
    pub fn new(rx: broadcast::Receiver<Message>) -> Self {
        Self { rx, registry: None }
    }

    /// Next message on the channel, or `None` once the channel is gone.
    /// A subscriber that falls behind skips what it missed.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Broadcast subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some((channels, name)) = &self.registry else {
            return;
        };
        let Some(channels) = channels.upgrade() else {
            return;
        };
        let mut channels = channels.lock();
        // `self.rx` still counts until this returns
        if channels.get(name).is_some_and(|tx| tx.receiver_count() <= 1) {
            channels.remove(name);
        }
    }
}

/// [`Broadcaster`] over one `tokio::sync::broadcast` channel per name.
pub struct LocalBroadcaster {
    capacity: usize,
    channels: Arc<Channels>,
}

impl LocalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for LocalBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Broadcaster for LocalBroadcaster {
    fn publish(&self, channel: &str, message: Message) -> usize {
        let mut channels = self.channels.lock();
        let Some(tx) = channels.get(channel) else {
            return 0;
        };
        match tx.send(message) {
            Ok(reached) => reached,
            Err(_) => {
                // Every subscriber is gone
                channels.remove(channel);
                0
            }
        }
    }

    fn subscribe(&self, channel: &str) -> Subscription {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription {
            rx: tx.subscribe(),
            registry: Some((Arc::downgrade(&self.channels), channel.to_string())),
        }
    }
}
