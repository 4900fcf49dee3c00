//! `carscout-middleware` – messaging plumbing.
//!
//! Routes JSON payloads between the feed, the watching agents, and the core
//! without caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – channel-addressed publish/subscribe bus built on Tokio
//!   broadcast channels.
//! - [`client`] – the [`MessagingClient`] / [`AgentSession`] contract and
//!   the typed [`Subscription`] stream the core consumes.
//! - [`channels`] – [`ChannelScheme`], the single place channel addresses
//!   are spelled out.
//! - [`loopback`] – in-process transport over the bus, with a journal for
//!   inspection.

pub mod bus;
pub mod channels;
pub mod client;
pub mod loopback;

pub use bus::{ChannelReceiver, MessageBus};
pub use channels::ChannelScheme;
pub use client::{AgentSession, MessagingClient, QoS, Subscription};
pub use loopback::{Journal, LoopbackClient, LoopbackSession};
