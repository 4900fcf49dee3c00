//! The messaging-collaborator contract.
//!
//! CarScout never speaks to the broker directly.  The core consumes typed
//! [`Subscription`] streams and publishes JSON payloads through a
//! [`MessagingClient`]; the concrete transport (connection handling,
//! decompression, deserialisation, TLS) lives behind this trait.
//!
//! - [`MessagingClient`] – the feed-side client used by the scanner.
//! - [`AgentSession`] – a client scoped to one watching agent; it is the
//!   opaque capability stored in the watcher registry and is closed once the
//!   agent's booking exchange concludes.

use std::fmt;

use async_trait::async_trait;
use carscout_types::{AgentId, Message, ScoutError};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde_json::Value;

/// Delivery guarantee requested for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QoS {
    /// Fire and forget (QoS 0).
    AtMostOnce,
    /// Acknowledged delivery (QoS 1).
    AtLeastOnce,
}

impl QoS {
    /// Numeric level as used on the wire.
    pub fn level(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// A live stream of messages for one channel.
///
/// Dropping the subscription releases the underlying receiver.
pub struct Subscription {
    channel: String,
    stream: BoxStream<'static, Message>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, stream: BoxStream<'static, Message>) -> Self {
        Self {
            channel: channel.into(),
            stream,
        }
    }

    /// The channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message; `None` once the transport closed the stream.
    pub async fn next(&mut self) -> Option<Message> {
        self.stream.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// String-addressed publish/subscribe client.
///
/// # Contract
///
/// * `connect` – resolves once the connection is established; subscriptions
///   made before that may fail with [`ScoutError::Transport`].
/// * `subscribe` – returns a stream of already-decoded payloads.
/// * `publish` – hands a JSON payload to the transport; failures are
///   reported, never retried.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    async fn connect(&self) -> Result<(), ScoutError>;

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, channel: &str, qos: QoS) -> Result<Subscription, ScoutError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), ScoutError>;

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), ScoutError>;
}

/// A messaging session owned by a single watching agent.
#[async_trait]
pub trait AgentSession: MessagingClient {
    /// The agent's identifier; it addresses the agent's private channel.
    fn agent_id(&self) -> &AgentId;

    /// Release the session.  Called once the agent's exchange concludes.
    async fn close(&self) -> Result<(), ScoutError>;
}
