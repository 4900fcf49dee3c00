//! In-process loopback transport.
//!
//! [`LoopbackClient`] and [`LoopbackSession`] implement the messaging
//! contract on top of a shared [`MessageBus`], so the scanner can run end to
//! end without a broker.  Both keep a journal of what they did (publishes,
//! unsubscribes, closes) which tests and the CLI console inspect.
//!
//! Unsubscribing ends every stream the client opened on that channel, as a
//! broker connection would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{AbortHandle, abortable};
use carscout_types::{AgentId, ScoutError};
use serde_json::Value;
use tracing::debug;

use crate::bus::MessageBus;
use crate::client::{AgentSession, MessagingClient, QoS, Subscription};

/// Everything a loopback client has done so far.
#[derive(Debug, Default, Clone)]
pub struct Journal {
    pub published: Vec<(String, Value)>,
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
    pub closes: usize,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Mutex<Journal>,
    /// Abort handles of the open streams, per channel.
    streams: Mutex<HashMap<String, Vec<AbortHandle>>>,
    connected: AtomicBool,
    fail_publishes: AtomicBool,
    fail_subscribes: AtomicBool,
}

/// Feed-side client bound to a [`MessageBus`].  Clones share state.
#[derive(Clone, Debug)]
pub struct LoopbackClient {
    bus: MessageBus,
    shared: Arc<Shared>,
}

impl LoopbackClient {
    /// Create a client that still needs [`MessagingClient::connect`].
    pub fn new(bus: MessageBus) -> Self {
        Self {
            bus,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Create a client that is already connected.
    pub fn connected(bus: MessageBus) -> Self {
        let client = Self::new(bus);
        client.shared.connected.store(true, Ordering::SeqCst);
        client
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Make every subsequent publish fail with a transport error.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.shared.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent subscribe fail with a transport error.
    pub fn set_fail_subscribes(&self, fail: bool) {
        self.shared.fail_subscribes.store(fail, Ordering::SeqCst);
    }

    /// A copy of the journal.
    pub fn journal(&self) -> Journal {
        self.lock_journal().clone()
    }

    /// Payloads published on `channel`, in order.
    pub fn published_on(&self, channel: &str) -> Vec<Value> {
        self.lock_journal()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.lock_journal().closes
    }

    fn lock_journal(&self) -> MutexGuard<'_, Journal> {
        self.shared
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, Vec<AbortHandle>>> {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self, channel: &str) -> Result<(), ScoutError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ScoutError::Transport {
                channel: channel.to_string(),
                details: "client is not connected".to_string(),
            })
        }
    }
}

#[async_trait]
impl MessagingClient for LoopbackClient {
    async fn connect(&self) -> Result<(), ScoutError> {
        self.shared.connected.store(true, Ordering::SeqCst);
        debug!("loopback client connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, channel: &str, qos: QoS) -> Result<Subscription, ScoutError> {
        self.ensure_connected(channel)?;
        if self.shared.fail_subscribes.load(Ordering::SeqCst) {
            return Err(ScoutError::Transport {
                channel: channel.to_string(),
                details: "subscribe rejected".to_string(),
            });
        }
        let receiver = self.bus.subscribe(channel)?;
        let (stream, handle) = abortable(receiver.into_stream());
        self.lock_streams()
            .entry(channel.to_string())
            .or_default()
            .push(handle);
        self.lock_journal().subscribed.push(channel.to_string());
        debug!(channel, qos = qos.level(), "loopback subscribe");
        Ok(Subscription::new(channel, Box::pin(stream)))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ScoutError> {
        let ended = self.lock_streams().remove(channel).unwrap_or_default();
        for handle in &ended {
            handle.abort();
        }
        self.lock_journal().unsubscribed.push(channel.to_string());
        debug!(channel, streams = ended.len(), "loopback unsubscribe");
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), ScoutError> {
        self.ensure_connected(channel)?;
        if self.shared.fail_publishes.load(Ordering::SeqCst) {
            return Err(ScoutError::Transport {
                channel: channel.to_string(),
                details: "publish rejected".to_string(),
            });
        }
        self.lock_journal()
            .published
            .push((channel.to_string(), payload.clone()));
        self.bus.publish(channel, payload)?;
        Ok(())
    }
}

/// A loopback client scoped to one watching agent.
#[derive(Clone, Debug)]
pub struct LoopbackSession {
    agent_id: AgentId,
    client: LoopbackClient,
}

impl LoopbackSession {
    /// Create an already-connected session for `agent_id`.
    pub fn new(bus: MessageBus, agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            client: LoopbackClient::connected(bus),
        }
    }

    /// The underlying client, for journal inspection and failure injection.
    pub fn client(&self) -> &LoopbackClient {
        &self.client
    }
}

#[async_trait]
impl MessagingClient for LoopbackSession {
    async fn connect(&self) -> Result<(), ScoutError> {
        self.client.connect().await
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn subscribe(&self, channel: &str, qos: QoS) -> Result<Subscription, ScoutError> {
        self.client.subscribe(channel, qos).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ScoutError> {
        self.client.unsubscribe(channel).await
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<(), ScoutError> {
        self.client.publish(channel, payload).await
    }
}

#[async_trait]
impl AgentSession for LoopbackSession {
    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    async fn close(&self) -> Result<(), ScoutError> {
        self.client.lock_journal().closes += 1;
        self.client.shared.connected.store(false, Ordering::SeqCst);
        debug!(agent = %self.agent_id, "loopback session closed");
        Ok(())
    }
}
