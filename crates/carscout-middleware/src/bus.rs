//! Headless, channel-addressed publish/subscribe bus.
//!
//! Uses one [`tokio::sync::broadcast`] channel per string address so that
//! every subscriber of a channel receives every message published to it
//! without any single subscriber blocking the others.  Channels are created
//! lazily on first subscription and dropped once their last subscriber is
//! gone.
//!
//! The bus is the in-process stand-in for the upstream broker: the loopback
//! clients in [`crate::loopback`] publish and subscribe through it, and the
//! CLI console drives it by hand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use carscout_types::{Message, ScoutError};
use futures_util::stream::{self, BoxStream};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

/// Default per-channel capacity (number of buffered messages before old ones
/// are dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Shared message bus. Clone it cheaply – all clones share the same
/// underlying channel table.
#[derive(Clone, Debug)]
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
    capacity: usize,
}

impl MessageBus {
    /// Create a new bus; `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish `payload` on `channel`, wrapped in a fresh [`Message`].
    ///
    /// Returns the number of subscribers that were handed the message.
    /// Returns `Ok(0)` when nobody listens on the channel (a normal
    /// condition, not an error).
    pub fn publish(&self, channel: &str, payload: Value) -> Result<usize, ScoutError> {
        self.publish_message(Message::new(channel, payload))
    }

    /// Publish a pre-built [`Message`] on its own channel.
    pub fn publish_message(&self, message: Message) -> Result<usize, ScoutError> {
        let mut channels = self.lock()?;
        let Some(sender) = channels.get(&message.channel) else {
            return Ok(0);
        };
        match sender.send(message) {
            Ok(n) => Ok(n),
            Err(broadcast::error::SendError(message)) => {
                // Every receiver is gone; forget the channel.
                channels.remove(&message.channel);
                Ok(0)
            }
        }
    }

    /// Subscribe to every message subsequently published on `channel`.
    pub fn subscribe(&self, channel: &str) -> Result<ChannelReceiver, ScoutError> {
        let mut channels = self.lock()?;
        let capacity = self.capacity;
        let receiver = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();
        Ok(ChannelReceiver {
            channel: channel.to_string(),
            receiver,
        })
    }

    /// Number of live subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .map(|channels| {
                channels
                    .get(channel)
                    .map(|s| s.receiver_count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, broadcast::Sender<Message>>>, ScoutError> {
        self.channels
            .lock()
            .map_err(|_| ScoutError::Channel("message bus channel table poisoned".to_string()))
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single bus channel.
///
/// Obtained via [`MessageBus::subscribe`].
pub struct ChannelReceiver {
    channel: String,
    receiver: broadcast::Receiver<Message>,
}

impl ChannelReceiver {
    /// Wait for the next message on this channel.
    ///
    /// Returns `None` when the channel is closed and no further messages
    /// will arrive.  A lagging receiver logs how many messages it missed and
    /// keeps going.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(channel = %self.channel, lagged_by = n, "ChannelReceiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// The channel this receiver is bound to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Turn the receiver into a boxed stream of messages.
    pub fn into_stream(self) -> BoxStream<'static, Message> {
        Box::pin(stream::unfold(self, |mut rx| async move {
            rx.recv().await.map(|message| (message, rx))
        }))
    }
}
