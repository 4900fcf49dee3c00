//! [`Scanner`] – the single task that owns the core state.
//!
//! The scanner task owns the [`FeedListener`] (and with it the vehicle
//! index) and the [`ReservationDispatcher`] (and with it the watcher
//! registry).  It multiplexes, in priority order:
//!
//! 1. the vehicle snapshot subscription,
//! 2. the vehicle delta subscription,
//! 3. outstanding booking response waits,
//! 4. commands from [`ScannerHandle`]s.
//!
//! Every mutation happens on this task, so nothing in the core is locked.
//! Malformed or out-of-order events are logged and skipped; nothing short of
//! a shutdown command (or every handle being dropped) ends the loop.

use std::sync::Arc;
use std::time::Duration;

use carscout_kernel::{DispatchMode, DispatchPolicy};
use carscout_memory::{AttemptLedger, LedgerEntry, LedgerError};
use carscout_middleware::{AgentSession, ChannelScheme, MessagingClient, QoS, Subscription};
use carscout_types::{AgentId, LocationId, LocationPoint, Message, ScoutError, VehiclePoint};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::{DEFAULT_RESPONSE_TIMEOUT, PendingResponse, ReservationDispatcher};
use crate::feed_listener::{FeedListener, FeedState};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration & errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub channels: ChannelScheme,
    pub dispatch_mode: DispatchMode,
    /// Coordinates of watchable locations, for proximity matching.
    pub locations: Vec<LocationPoint>,
    pub response_timeout: Duration,
    /// Keep the snapshot subscription after the first snapshot.
    pub resnapshot: bool,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            channels: ChannelScheme::default(),
            dispatch_mode: DispatchMode::default(),
            locations: Vec::new(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            resnapshot: false,
            command_buffer: 64,
        }
    }
}

#[derive(Error, Debug)]
pub enum ScannerError {
    #[error(transparent)]
    Scout(#[from] ScoutError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("no attempt ledger configured")]
    NoLedger,
    #[error("scanner task has stopped")]
    Stopped,
}

/// Point-in-time view of the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerStatus {
    pub feed_state: FeedState,
    pub indexed_vehicles: usize,
    pub watchers: usize,
    pub in_flight: usize,
    pub dispatch_mode: DispatchMode,
}

enum Command {
    Register {
        session: Arc<dyn AgentSession>,
        location: LocationId,
        reply: oneshot::Sender<bool>,
    },
    Unregister {
        agent: AgentId,
        reply: oneshot::Sender<bool>,
    },
    AgentDisconnected {
        agent: AgentId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<ScannerStatus>,
    },
    Nearest {
        latitude: f64,
        longitude: f64,
        k: usize,
        reply: oneshot::Sender<Vec<VehiclePoint>>,
    },
    Ledger {
        reply: oneshot::Sender<Result<Vec<LedgerEntry>, ScannerError>>,
    },
    Shutdown,
}

// ─────────────────────────────────────────────────────────────────────────────
// Scanner
// ─────────────────────────────────────────────────────────────────────────────

pub struct Scanner {
    client: Arc<dyn MessagingClient>,
    channels: ChannelScheme,
    feed: FeedListener,
    dispatcher: ReservationDispatcher,
    snapshot: Option<Subscription>,
    delta: Option<Subscription>,
    responses: FuturesUnordered<PendingResponse>,
}

impl Scanner {
    /// Connect `client`, subscribe to the feed channels and spawn the event
    /// loop on the current Tokio runtime.
    pub async fn start(
        config: ScannerConfig,
        client: Arc<dyn MessagingClient>,
        ledger: Option<AttemptLedger>,
    ) -> Result<ScannerHandle, ScannerError> {
        if !client.is_connected() {
            client.connect().await?;
        }
        let snapshot = client
            .subscribe(&config.channels.vehicle_list(), QoS::AtMostOnce)
            .await?;
        let delta = client
            .subscribe(&config.channels.vehicle_delta(), QoS::AtLeastOnce)
            .await?;

        if config.dispatch_mode == DispatchMode::Broadcast {
            warn!("broadcast dispatch enabled: every watcher races for every added vehicle");
        }
        let policy = DispatchPolicy::new(config.dispatch_mode, config.locations);
        let mut dispatcher =
            ReservationDispatcher::new(policy, config.channels.clone(), config.response_timeout);
        if let Some(ledger) = ledger {
            dispatcher = dispatcher.with_ledger(ledger);
        }

        let scanner = Scanner {
            client,
            channels: config.channels,
            feed: FeedListener::new(config.resnapshot),
            dispatcher,
            snapshot: Some(snapshot),
            delta: Some(delta),
            responses: FuturesUnordered::new(),
        };
        info!(
            snapshot = %scanner.channels.vehicle_list(),
            delta = %scanner.channels.vehicle_delta(),
            "scanner listening"
        );

        let (commands, inbox) = mpsc::channel(config.command_buffer.max(1));
        let task = tokio::spawn(scanner.run(inbox));
        Ok(ScannerHandle { commands, task })
    }

    async fn run(mut self, mut inbox: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;
                message = next_message(&mut self.snapshot) => match message {
                    Some(message) => self.on_snapshot(message).await,
                    None => {
                        warn!("snapshot stream ended");
                        self.snapshot = None;
                    }
                },
                message = next_message(&mut self.delta) => match message {
                    Some(message) => self.on_delta(message).await,
                    None => {
                        warn!("delta stream ended");
                        self.delta = None;
                    }
                },
                Some(outcome) = self.responses.next(), if !self.responses.is_empty() => {
                    self.dispatcher.on_outcome(outcome).await;
                }
                command = inbox.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
            }
        }
        self.shutdown().await;
    }

    async fn on_snapshot(&mut self, message: Message) {
        let outcome = match self.feed.handle_snapshot(&message.channel, &message.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "dropping vehicle snapshot");
                return;
            }
        };
        if outcome.unsubscribe && self.snapshot.take().is_some() {
            if let Err(e) = self.client.unsubscribe(&message.channel).await {
                warn!(channel = %message.channel, error = %e, "snapshot unsubscribe failed");
            }
            info!(channel = %message.channel, "snapshot channel released");
        }
    }

    async fn on_delta(&mut self, message: Message) {
        let outcome = match self.feed.handle_delta(&message.channel, &message.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "dropping vehicle delta");
                return;
            }
        };
        for vehicle in &outcome.added {
            let waits = self.dispatcher.dispatch(vehicle).await;
            self.responses.extend(waits);
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Register {
                session,
                location,
                reply,
            } => {
                let _ = reply.send(self.dispatcher.register(session, location));
            }
            Command::Unregister { agent, reply } => {
                let removed = self.dispatcher.unregister(&agent).await;
                let _ = reply.send(removed);
            }
            Command::AgentDisconnected { agent, reply } => {
                let _ = reply.send(self.dispatcher.agent_disconnected(&agent));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Nearest {
                latitude,
                longitude,
                k,
                reply,
            } => {
                let _ = reply.send(self.feed.nearest(latitude, longitude, k));
            }
            Command::Ledger { reply } => {
                let entries = match self.dispatcher.ledger() {
                    Some(ledger) => ledger.list_all().map_err(ScannerError::from),
                    None => Err(ScannerError::NoLedger),
                };
                let _ = reply.send(entries);
            }
            Command::Shutdown => {}
        }
    }

    fn status(&self) -> ScannerStatus {
        ScannerStatus {
            feed_state: self.feed.state(),
            indexed_vehicles: self.feed.indexed_vehicles(),
            watchers: self.dispatcher.registry().len(),
            in_flight: self.dispatcher.in_flight(),
            dispatch_mode: self.dispatcher.policy().mode(),
        }
    }

    async fn shutdown(&mut self) {
        let outstanding = self.dispatcher.in_flight();
        self.dispatcher.abort_all();
        self.responses.clear();
        for channel in [self.channels.vehicle_list(), self.channels.vehicle_delta()] {
            if let Err(e) = self.client.unsubscribe(&channel).await {
                debug!(channel = %channel, error = %e, "unsubscribe on shutdown failed");
            }
        }
        self.snapshot = None;
        self.delta = None;
        info!(outstanding, "scanner stopped");
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Message> {
    match subscription {
        Some(subscription) => subscription.next().await,
        None => std::future::pending().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ScannerHandle
// ─────────────────────────────────────────────────────────────────────────────

/// Control surface of a running [`Scanner`].
pub struct ScannerHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl ScannerHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ScannerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| ScannerError::Stopped)?;
        response.await.map_err(|_| ScannerError::Stopped)
    }

    /// Register (or re-register) a watcher.  `true` when the agent is new.
    pub async fn register(
        &self,
        session: Arc<dyn AgentSession>,
        location: LocationId,
    ) -> Result<bool, ScannerError> {
        self.request(|reply| Command::Register {
            session,
            location,
            reply,
        })
        .await
    }

    /// Remove a watcher.  `false` when it was not registered.
    pub async fn unregister(&self, agent: AgentId) -> Result<bool, ScannerError> {
        self.request(|reply| Command::Unregister { agent, reply }).await
    }

    /// Report that `agent`'s transport is gone.
    pub async fn agent_disconnected(&self, agent: AgentId) -> Result<bool, ScannerError> {
        self.request(|reply| Command::AgentDisconnected { agent, reply })
            .await
    }

    pub async fn status(&self) -> Result<ScannerStatus, ScannerError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Up to `k` indexed vehicles nearest to a position.
    pub async fn nearest(
        &self,
        latitude: f64,
        longitude: f64,
        k: usize,
    ) -> Result<Vec<VehiclePoint>, ScannerError> {
        self.request(|reply| Command::Nearest {
            latitude,
            longitude,
            k,
            reply,
        })
        .await
    }

    /// Every recorded reservation attempt.
    pub async fn ledger(&self) -> Result<Vec<LedgerEntry>, ScannerError> {
        self.request(|reply| Command::Ledger { reply }).await?
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), ScannerError> {
        // A closed channel means the loop is already gone.
        let _ = self.commands.send(Command::Shutdown).await;
        self.task.await.map_err(|_| ScannerError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carscout_memory::AttemptLedger;
    use carscout_middleware::{LoopbackClient, LoopbackSession, MessageBus};
    use carscout_types::AttemptState;
    use serde_json::{Value, json};

    const LIST: &str = "C2G/VEHICLELIST";
    const DELTA: &str = "C2G/VEHICLELISTDELTA";
    const W1_REQUEST: &str = "C2G/C2S/11/w1/REQUESTBOOKING";

    fn berlin_config() -> ScannerConfig {
        ScannerConfig {
            locations: vec![
                LocationPoint::new("11", 52.52, 13.405),
                LocationPoint::new("22", 48.85, 2.35),
            ],
            ..ScannerConfig::default()
        }
    }

    fn snapshot() -> Value {
        json!({
            "connectedVehicles": [
                {"id": "v1", "geoCoordinate": {"latitude": 52.52, "longitude": 13.405}},
                {"id": "v2", "geoCoordinate": {"latitude": 48.85, "longitude": 2.35}}
            ]
        })
    }

    fn delta_adding(id: &str, lat: f64, lon: f64) -> Value {
        json!({"addedVehicles": [{"id": id, "latitude": lat, "longitude": lon}], "removedVehicles": []})
    }

    async fn start(config: ScannerConfig, bus: &MessageBus) -> (ScannerHandle, LoopbackClient) {
        let client = LoopbackClient::connected(bus.clone());
        let handle = Scanner::start(
            config,
            Arc::new(client.clone()),
            Some(AttemptLedger::open_in_memory().unwrap()),
        )
        .await
        .unwrap();
        (handle, client)
    }

    /// Wait until the scanner has no outstanding work visible in `status`.
    async fn settle(handle: &ScannerHandle) -> ScannerStatus {
        handle.status().await.unwrap()
    }

    #[tokio::test]
    async fn added_vehicle_near_watched_location_is_requested_once() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        assert!(handle.register(w1.clone(), "11".into()).await.unwrap());

        bus.publish(LIST, snapshot()).unwrap();
        bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
        let status = settle(&handle).await;

        let sent = w1.client().published_on(W1_REQUEST);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["targetVehicle"], "v3");
        assert_eq!(status.in_flight, 1);
        assert_eq!(status.feed_state, FeedState::Streaming);
        assert_eq!(status.indexed_vehicles, 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn booking_response_retires_watcher_exactly_once() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        handle.register(w1.clone(), "11".into()).await.unwrap();

        bus.publish(LIST, snapshot()).unwrap();
        bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
        settle(&handle).await;

        bus.publish("C2G/P2P/w1", json!({"eventType": "BOOKING_RESPONSE"}))
            .unwrap();
        let status = settle(&handle).await;
        assert_eq!(status.watchers, 0);
        assert_eq!(status.in_flight, 0);
        assert_eq!(w1.client().close_count(), 1);

        bus.publish(DELTA, delta_adding("v4", 52.5205, 13.4051)).unwrap();
        settle(&handle).await;
        assert_eq!(w1.client().published_on(W1_REQUEST).len(), 1);
        assert_eq!(w1.client().close_count(), 1);

        let ledger = handle.ledger().await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].state, AttemptState::Done);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_delta_issues_no_requests() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        handle.register(w1.clone(), "11".into()).await.unwrap();

        bus.publish(LIST, snapshot()).unwrap();
        bus.publish(DELTA, json!({"addedVehicles": [], "removedVehicles": []}))
            .unwrap();
        let status = settle(&handle).await;
        assert!(w1.client().journal().published.is_empty());
        assert_eq!(status.in_flight, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn delta_before_snapshot_is_dropped() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        handle.register(w1.clone(), "11".into()).await.unwrap();

        bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
        let status = settle(&handle).await;
        assert_eq!(status.feed_state, FeedState::Uninitialized);
        assert!(w1.client().journal().published.is_empty());

        // The loop survives and processes the feed once a snapshot arrives.
        bus.publish(LIST, snapshot()).unwrap();
        bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
        settle(&handle).await;
        assert_eq!(w1.client().published_on(W1_REQUEST).len(), 1);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_events_do_not_stop_the_loop() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        bus.publish(LIST, json!({"unexpected": true})).unwrap();
        bus.publish(LIST, snapshot()).unwrap();
        let status = settle(&handle).await;
        assert_eq!(status.feed_state, FeedState::Ready);
        assert_eq!(status.indexed_vehicles, 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_channel_released_after_first_snapshot() {
        let bus = MessageBus::default();
        let (handle, client) = start(berlin_config(), &bus).await;
        bus.publish(LIST, snapshot()).unwrap();
        settle(&handle).await;
        assert_eq!(client.journal().unsubscribed, vec![LIST.to_string()]);

        bus.publish(
            LIST,
            json!({"connectedVehicles": [{"id": "v9", "geoCoordinate": {"latitude": 0.0, "longitude": 0.0}}]}),
        )
        .unwrap();
        let status = settle(&handle).await;
        assert_eq!(status.indexed_vehicles, 2);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn resnapshot_replaces_index() {
        let bus = MessageBus::default();
        let config = ScannerConfig {
            resnapshot: true,
            ..berlin_config()
        };
        let (handle, client) = start(config, &bus).await;
        bus.publish(LIST, snapshot()).unwrap();
        settle(&handle).await;
        bus.publish(
            LIST,
            json!({"connectedVehicles": [{"id": "v9", "geoCoordinate": {"latitude": 0.0, "longitude": 0.0}}]}),
        )
        .unwrap();
        let status = settle(&handle).await;
        assert_eq!(status.indexed_vehicles, 1);
        assert!(client.journal().unsubscribed.is_empty());
        let nearest = handle.nearest(52.52, 13.405, 5).await.unwrap();
        assert_eq!(nearest.len(), 1);
        assert_eq!(nearest[0].id, "v9");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn proximity_excludes_far_watchers_and_broadcast_includes_them() {
        for (mode, expected_w2) in [
            (DispatchMode::Proximity { radius_m: 150.0 }, 0),
            (DispatchMode::Broadcast, 1),
        ] {
            let bus = MessageBus::default();
            let config = ScannerConfig {
                dispatch_mode: mode,
                ..berlin_config()
            };
            let (handle, _) = start(config, &bus).await;
            let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
            let w2 = Arc::new(LoopbackSession::new(bus.clone(), "w2"));
            handle.register(w1.clone(), "11".into()).await.unwrap();
            handle.register(w2.clone(), "22".into()).await.unwrap();

            bus.publish(LIST, snapshot()).unwrap();
            bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
            let status = settle(&handle).await;

            assert_eq!(w1.client().published_on(W1_REQUEST).len(), 1);
            assert_eq!(
                w2.client()
                    .published_on("C2G/C2S/22/w2/REQUESTBOOKING")
                    .len(),
                expected_w2,
                "mode {mode:?}"
            );
            assert_eq!(status.dispatch_mode, mode);
            handle.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn unanswered_request_times_out_and_retires_watcher() {
        let bus = MessageBus::default();
        let config = ScannerConfig {
            response_timeout: Duration::from_millis(50),
            ..berlin_config()
        };
        let (handle, _) = start(config, &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        handle.register(w1.clone(), "11".into()).await.unwrap();
        bus.publish(LIST, snapshot()).unwrap();
        bus.publish(DELTA, delta_adding("v3", 52.521, 13.406)).unwrap();
        assert_eq!(settle(&handle).await.in_flight, 1);

        let mut status = settle(&handle).await;
        for _ in 0..100 {
            if status.watchers == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = settle(&handle).await;
        }
        assert_eq!(status.watchers, 0);
        assert_eq!(status.in_flight, 0);
        assert_eq!(w1.client().close_count(), 1);
        let ledger = handle.ledger().await.unwrap();
        assert_eq!(ledger[0].state, AttemptState::TimedOut);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn register_is_idempotent_through_the_handle() {
        let bus = MessageBus::default();
        let (handle, _) = start(berlin_config(), &bus).await;
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        assert!(handle.register(w1.clone(), "11".into()).await.unwrap());
        assert!(!handle.register(w1.clone(), "11".into()).await.unwrap());
        assert_eq!(settle(&handle).await.watchers, 1);

        assert!(handle.unregister("w1".into()).await.unwrap());
        assert!(!handle.agent_disconnected("w1".into()).await.unwrap());
        assert_eq!(settle(&handle).await.watchers, 0);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ledger_command_without_ledger_reports_it() {
        let bus = MessageBus::default();
        let client = LoopbackClient::new(bus.clone());
        let handle = Scanner::start(ScannerConfig::default(), Arc::new(client.clone()), None)
            .await
            .unwrap();
        assert!(client.is_connected());
        assert!(matches!(
            handle.ledger().await.unwrap_err(),
            ScannerError::NoLedger
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_fails_when_feed_subscribe_is_rejected() {
        let bus = MessageBus::default();
        let client = LoopbackClient::connected(bus);
        client.set_fail_subscribes(true);
        let err = Scanner::start(ScannerConfig::default(), Arc::new(client), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScannerError::Scout(ScoutError::Transport { .. })));
    }
}
