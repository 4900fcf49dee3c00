//! [`ReservationDispatcher`] – turns "vehicle added" into booking requests.
//!
//! For every added vehicle the dispatcher asks the [`DispatchPolicy`] which
//! registered watchers are eligible, and for each of them:
//!
//! 1. opens a private response subscription through the watcher's session,
//! 2. logs the intent (and records it in the [`AttemptLedger`]),
//! 3. publishes the booking request,
//! 4. returns a [`PendingResponse`] future that resolves once the response
//!    channel yields a terminal event, times out, closes, or is aborted.
//!
//! The caller drives those futures and feeds their [`AttemptOutcome`] back
//! through [`ReservationDispatcher::on_outcome`], which retires the watcher.
//! Retiring aborts every sibling attempt of the same watcher, so each
//! session involved in the exchange is closed at most once.  An attempt
//! remembers the session it was sent through; a watcher re-registered with a
//! fresh session mid-exchange still gets the original session closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use carscout_kernel::{DispatchMode, DispatchPolicy, Watcher, WatcherRegistry};
use carscout_memory::AttemptLedger;
use carscout_middleware::{AgentSession, ChannelScheme, QoS, Subscription};
use carscout_types::{
    AgentEvent, AgentId, AttemptState, LocationId, ReservationAttempt, ScoutError, VehicleDelta,
    decode_payload,
};
use futures_util::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default wait for a terminal response before the watcher is retired.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// How a single response wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// A `BOOKING_RESPONSE` arrived; the transaction is concluded.
    Concluded,
    /// The response stream ended (transport-level disconnection).
    ChannelClosed,
    /// Nothing terminal arrived within the response timeout.
    TimedOut,
    /// The wait was cancelled because the watcher was already retired.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub attempt: Uuid,
    pub agent: AgentId,
    pub outcome: ResponseOutcome,
}

/// A response wait, ready to be pushed into a `FuturesUnordered`.
pub type PendingResponse = BoxFuture<'static, AttemptOutcome>;

/// Wait on `subscription` for a `BOOKING_RESPONSE`, bounded by `wait` and
/// cancellable through `registration`.
pub fn await_response(
    attempt: Uuid,
    agent: AgentId,
    mut subscription: Subscription,
    wait: Duration,
    registration: AbortRegistration,
) -> PendingResponse {
    let watch = async move {
        while let Some(message) = subscription.next().await {
            match decode_payload::<AgentEvent>(&message.channel, &message.payload) {
                Ok(event) if event.is_booking_response() => return ResponseOutcome::Concluded,
                Ok(event) => {
                    debug!(channel = %message.channel, event_type = %event.event_type, "ignoring agent event")
                }
                Err(e) => warn!(error = %e, "skipping malformed agent event"),
            }
        }
        ResponseOutcome::ChannelClosed
    };
    Box::pin(async move {
        let outcome = match Abortable::new(tokio::time::timeout(wait, watch), registration).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_elapsed)) => ResponseOutcome::TimedOut,
            Err(_aborted) => ResponseOutcome::Aborted,
        };
        AttemptOutcome {
            attempt,
            agent,
            outcome,
        }
    })
}

async fn release_channel(session: &Arc<dyn AgentSession>, channel: &str) {
    if let Err(e) = session.unsubscribe(channel).await {
        debug!(channel, error = %e, "unsubscribe failed");
    }
}

fn same_session(a: &Arc<dyn AgentSession>, b: &Arc<dyn AgentSession>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Keep the first occurrence of every session.
fn distinct(sessions: Vec<Arc<dyn AgentSession>>) -> Vec<Arc<dyn AgentSession>> {
    let mut unique: Vec<Arc<dyn AgentSession>> = Vec::with_capacity(sessions.len());
    for session in sessions {
        if !unique.iter().any(|known| same_session(known, &session)) {
            unique.push(session);
        }
    }
    unique
}

// ─────────────────────────────────────────────────────────────────────────────
// ReservationDispatcher
// ─────────────────────────────────────────────────────────────────────────────

struct InFlight {
    attempt: ReservationAttempt,
    /// The session that published the request and owns the subscription.
    session: Arc<dyn AgentSession>,
    abort: AbortHandle,
}

pub struct ReservationDispatcher {
    registry: WatcherRegistry,
    policy: DispatchPolicy,
    channels: ChannelScheme,
    ledger: Option<AttemptLedger>,
    in_flight: HashMap<Uuid, InFlight>,
    response_timeout: Duration,
}

impl ReservationDispatcher {
    pub fn new(policy: DispatchPolicy, channels: ChannelScheme, response_timeout: Duration) -> Self {
        Self {
            registry: WatcherRegistry::new(),
            policy,
            channels,
            ledger: None,
            in_flight: HashMap::new(),
            response_timeout,
        }
    }

    /// Record every attempt in `ledger`.
    pub fn with_ledger(mut self, ledger: AttemptLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.registry
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> Option<&AttemptLedger> {
        self.ledger.as_ref()
    }

    /// Number of attempts still awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Attempts in flight for `agent`.
    pub fn in_flight_for(&self, agent: &AgentId) -> usize {
        self.in_flight
            .values()
            .filter(|f| &f.attempt.agent == agent)
            .count()
    }

    /// Register (or re-register) a watcher.
    pub fn register(&mut self, session: Arc<dyn AgentSession>, location: LocationId) -> bool {
        if matches!(self.policy.mode(), DispatchMode::Proximity { .. })
            && !self.policy.knows_location(&location)
        {
            warn!(
                location = %location,
                "location has no configured coordinates; only address matches will dispatch"
            );
        }
        self.registry.register(session, location)
    }

    /// Remove a watcher on request.  Its attempts are abandoned and its
    /// private channel released; the session itself stays open.
    pub async fn unregister(&mut self, agent: &AgentId) -> bool {
        let Some(watcher) = self.registry.unregister(agent) else {
            return false;
        };
        let mut sessions = self.discard_attempts(agent, AttemptState::Failed, Some("watcher unregistered"));
        sessions.push(watcher.session);
        let private = self.channels.private(agent);
        for session in distinct(sessions) {
            release_channel(&session, &private).await;
        }
        info!(agent = %agent, "watcher unregistered");
        true
    }

    /// The agent's transport went away: forget it without touching its
    /// session.
    pub fn agent_disconnected(&mut self, agent: &AgentId) -> bool {
        if self.registry.unregister(agent).is_none() {
            return false;
        }
        self.discard_attempts(agent, AttemptState::Failed, Some("agent disconnected"));
        warn!(agent = %agent, "agent disconnected; watcher dropped");
        true
    }

    /// Issue a booking request for `vehicle` to every eligible watcher.
    ///
    /// Returns one response wait per request that was actually published.
    /// Subscribe and publish failures are logged and recorded, never retried.
    pub async fn dispatch(&mut self, vehicle: &VehicleDelta) -> Vec<PendingResponse> {
        let selected = self.policy.select(&self.registry.list(), vehicle);
        debug!(vehicle = %vehicle.id, eligible = selected.len(), "watchers selected");

        let mut pending = Vec::with_capacity(selected.len());
        for watcher in selected {
            if let Some(wait) = self.reserve(watcher, vehicle).await {
                pending.push(wait);
            }
        }
        pending
    }

    async fn reserve(&mut self, watcher: Watcher, vehicle: &VehicleDelta) -> Option<PendingResponse> {
        let agent = watcher.agent_id().clone();
        let private = self.channels.private(&agent);
        let mut attempt =
            ReservationAttempt::new(agent.clone(), watcher.location.clone(), vehicle.id.clone());

        let subscription = match watcher.session.subscribe(&private, QoS::AtLeastOnce).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(agent = %agent, vehicle = %vehicle.id, error = %e, "response subscription failed");
                attempt.state = AttemptState::Failed;
                self.ledger_record(&attempt);
                self.ledger_mark(&attempt.id, AttemptState::Failed, Some(e.to_string().as_str()));
                return None;
            }
        };

        info!(
            agent = %agent,
            location = %watcher.location,
            vehicle = %vehicle.id,
            attempt = %attempt.id,
            "reserving vehicle for watcher"
        );
        self.ledger_record(&attempt);

        let topic = self.channels.request_booking(&watcher.location, &agent);
        let published = match serde_json::to_value(attempt.booking_request()) {
            Ok(payload) => watcher.session.publish(&topic, payload).await,
            Err(e) => Err(ScoutError::Serialization(e.to_string())),
        };
        if let Err(e) = published {
            warn!(agent = %agent, vehicle = %vehicle.id, error = %e, "booking request not sent");
            self.ledger_mark(&attempt.id, AttemptState::Failed, Some(e.to_string().as_str()));
            drop(subscription);
            // Sibling attempts through the same session share the channel.
            let shared = self
                .in_flight
                .values()
                .any(|f| f.attempt.agent == agent && same_session(&f.session, &watcher.session));
            if !shared {
                release_channel(&watcher.session, &private).await;
            }
            return None;
        }

        attempt.state = AttemptState::Dispatched;
        self.ledger_mark(&attempt.id, AttemptState::Dispatched, None);
        self.registry.mark_dispatched(&agent);

        let (abort, registration) = AbortHandle::new_pair();
        let wait = await_response(
            attempt.id,
            agent,
            subscription,
            self.response_timeout,
            registration,
        );
        self.in_flight.insert(
            attempt.id,
            InFlight {
                attempt,
                session: watcher.session,
                abort,
            },
        );
        Some(wait)
    }

    /// React to a finished response wait.
    ///
    /// Outcomes of attempts that are no longer in flight (already discarded
    /// by an earlier retirement) are ignored.
    pub async fn on_outcome(&mut self, outcome: AttemptOutcome) {
        let Some(entry) = self.in_flight.remove(&outcome.attempt) else {
            debug!(attempt = %outcome.attempt, "outcome for discarded attempt ignored");
            return;
        };
        let agent = outcome.agent;
        match outcome.outcome {
            ResponseOutcome::Concluded => {
                info!(agent = %agent, vehicle = %entry.attempt.vehicle_id, "booking exchange concluded");
                self.ledger_mark(&entry.attempt.id, AttemptState::Done, None);
                self.retire(entry.session, &agent, AttemptState::Done, None, true).await;
            }
            ResponseOutcome::TimedOut => {
                let err = ScoutError::ReservationTimeout {
                    agent: agent.clone(),
                    vehicle_id: entry.attempt.vehicle_id.clone(),
                };
                warn!(error = %err, "retiring watcher");
                let note = err.to_string();
                self.ledger_mark(&entry.attempt.id, AttemptState::TimedOut, Some(note.as_str()));
                self.retire(entry.session, &agent, AttemptState::TimedOut, Some(note.as_str()), true)
                    .await;
            }
            ResponseOutcome::ChannelClosed => {
                warn!(agent = %agent, "response stream ended; dropping watcher");
                let note = "response stream ended";
                self.ledger_mark(&entry.attempt.id, AttemptState::Failed, Some(note));
                self.retire(entry.session, &agent, AttemptState::Failed, Some(note), false)
                    .await;
            }
            ResponseOutcome::Aborted => {
                debug!(agent = %agent, attempt = %entry.attempt.id, "response wait aborted");
            }
        }
    }

    /// Abort every outstanding wait; the ledger keeps them unresolved.
    pub fn abort_all(&mut self) {
        for (_, entry) in self.in_flight.drain() {
            entry.abort.abort();
        }
    }

    /// Unregister `agent` after one of its attempts ended through `origin`.
    ///
    /// With `close`, every session involved (the origin, the sessions of
    /// discarded siblings, and the currently registered one) has its private
    /// channel released and is closed exactly once.
    async fn retire(
        &mut self,
        origin: Arc<dyn AgentSession>,
        agent: &AgentId,
        state: AttemptState,
        note: Option<&str>,
        close: bool,
    ) {
        let mut sessions = vec![origin];
        sessions.extend(self.discard_attempts(agent, state, note));
        if let Some(watcher) = self.registry.unregister(agent) {
            sessions.push(watcher.session);
        }
        if !close {
            return;
        }
        let private = self.channels.private(agent);
        for session in distinct(sessions) {
            release_channel(&session, &private).await;
            match session.close().await {
                Ok(()) => info!(agent = %agent, "watcher retired; session closed"),
                Err(e) => warn!(agent = %agent, error = %e, "closing session failed"),
            }
        }
    }

    /// Abort and forget every in-flight attempt of `agent`, returning the
    /// sessions they were sent through.
    fn discard_attempts(
        &mut self,
        agent: &AgentId,
        state: AttemptState,
        note: Option<&str>,
    ) -> Vec<Arc<dyn AgentSession>> {
        let ids: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| &f.attempt.agent == agent)
            .map(|(id, _)| *id)
            .collect();
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.in_flight.remove(&id) {
                entry.abort.abort();
                self.ledger_mark(&id, state, note);
                sessions.push(entry.session);
            }
        }
        sessions
    }

    fn ledger_record(&self, attempt: &ReservationAttempt) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.record_intent(attempt) {
                warn!(attempt = %attempt.id, error = %e, "ledger write failed");
            }
        }
    }

    fn ledger_mark(&self, id: &Uuid, state: AttemptState, note: Option<&str>) {
        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.mark(id, state, note) {
                warn!(attempt = %id, error = %e, "ledger update failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carscout_middleware::{LoopbackSession, MessageBus};
    use carscout_types::LocationPoint;
    use futures_util::StreamExt;
    use futures_util::stream::FuturesUnordered;
    use serde_json::json;

    fn dispatcher(mode: DispatchMode) -> ReservationDispatcher {
        let policy = DispatchPolicy::new(mode, vec![LocationPoint::new("11", 52.52, 13.405)]);
        ReservationDispatcher::new(policy, ChannelScheme::default(), Duration::from_secs(5))
            .with_ledger(AttemptLedger::open_in_memory().unwrap())
    }

    fn near_berlin() -> VehicleDelta {
        VehicleDelta::at("v3", 52.521, 13.406)
    }

    #[tokio::test]
    async fn dispatch_publishes_one_request_per_eligible_watcher() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::default());
        d.register(w1.clone(), "11".into());

        let pending = d.dispatch(&near_berlin()).await;
        assert_eq!(pending.len(), 1);
        let sent = w1.client().published_on("C2G/C2S/11/w1/REQUESTBOOKING");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["targetVehicle"], "v3");
        assert_eq!(sent[0]["locationId"], json!(11));
        assert!(sent[0]["timestamp"].is_i64());
        assert_eq!(d.in_flight(), 1);
    }

    #[tokio::test]
    async fn ledger_records_intent_then_dispatched() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1, "11".into());
        let _pending = d.dispatch(&near_berlin()).await;
        let entries = d.ledger().unwrap().list_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].state, AttemptState::Dispatched);
        assert_eq!(entries[0].vehicle_id, "v3");
    }

    #[tokio::test]
    async fn booking_response_closes_session_once_and_retires_watcher() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());

        let mut waits: FuturesUnordered<PendingResponse> = FuturesUnordered::new();
        waits.extend(d.dispatch(&near_berlin()).await);
        waits.extend(d.dispatch(&VehicleDelta::at("v4", 52.0, 13.0)).await);
        assert_eq!(d.in_flight_for(&"w1".into()), 2);

        bus.publish("C2G/P2P/w1", json!({"eventType": "BOOKING_RESPONSE"}))
            .unwrap();
        while let Some(outcome) = waits.next().await {
            d.on_outcome(outcome).await;
        }

        assert_eq!(w1.client().close_count(), 1);
        assert!(d.registry().is_empty());
        assert_eq!(d.in_flight(), 0);
        assert!(
            w1.client()
                .journal()
                .unsubscribed
                .contains(&"C2G/P2P/w1".to_string())
        );
        let ledger = d.ledger().unwrap();
        assert!(ledger.list_unresolved().unwrap().is_empty());
        assert!(
            ledger
                .list_all()
                .unwrap()
                .iter()
                .all(|e| e.state == AttemptState::Done)
        );
    }

    #[tokio::test]
    async fn retired_watcher_gets_no_further_requests() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());
        let mut waits: FuturesUnordered<PendingResponse> = FuturesUnordered::new();
        waits.extend(d.dispatch(&near_berlin()).await);
        bus.publish("C2G/P2P/w1", json!({"eventType": "BOOKING_RESPONSE"}))
            .unwrap();
        let outcome = waits.next().await.unwrap();
        d.on_outcome(outcome).await;

        assert!(d.dispatch(&VehicleDelta::at("v4", 52.0, 13.0)).await.is_empty());
        assert_eq!(
            w1.client()
                .published_on("C2G/C2S/11/w1/REQUESTBOOKING")
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn other_events_are_ignored_until_timeout() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let policy = DispatchPolicy::broadcast();
        let mut d = ReservationDispatcher::new(
            policy,
            ChannelScheme::default(),
            Duration::from_millis(50),
        );
        d.register(w1.clone(), "11".into());
        let mut pending = d.dispatch(&near_berlin()).await;
        bus.publish("C2G/P2P/w1", json!({"eventType": "VEHICLE_STATUS"}))
            .unwrap();
        bus.publish("C2G/P2P/w1", json!({"noEventType": true}))
            .unwrap();

        let outcome = pending.pop().unwrap().await;
        assert_eq!(outcome.outcome, ResponseOutcome::TimedOut);
        d.on_outcome(outcome).await;
        assert!(d.registry().is_empty());
        assert_eq!(w1.client().close_count(), 1);
    }

    #[tokio::test]
    async fn publish_failure_marks_attempt_failed() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        w1.client().set_fail_publishes(true);
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());

        assert!(d.dispatch(&near_berlin()).await.is_empty());
        assert_eq!(d.in_flight(), 0);
        assert!(d.registry().contains(&"w1".into()));
        let entries = d.ledger().unwrap().list_all().unwrap();
        assert_eq!(entries[0].state, AttemptState::Failed);
        assert!(
            w1.client()
                .journal()
                .unsubscribed
                .contains(&"C2G/P2P/w1".to_string())
        );
    }

    #[tokio::test]
    async fn sibling_publish_failure_keeps_live_attempt() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());

        let mut waits: FuturesUnordered<PendingResponse> = FuturesUnordered::new();
        waits.extend(d.dispatch(&near_berlin()).await);
        w1.client().set_fail_publishes(true);
        assert!(d.dispatch(&VehicleDelta::at("v4", 52.0, 13.0)).await.is_empty());
        assert!(w1.client().journal().unsubscribed.is_empty());

        bus.publish("C2G/P2P/w1", json!({"eventType": "BOOKING_RESPONSE"}))
            .unwrap();
        let outcome = waits.next().await.unwrap();
        assert_eq!(outcome.outcome, ResponseOutcome::Concluded);
        d.on_outcome(outcome).await;

        assert_eq!(w1.client().close_count(), 1);
        let entries = d.ledger().unwrap().list_all().unwrap();
        let state_of = |vehicle: &str| {
            entries
                .iter()
                .find(|e| e.vehicle_id == vehicle)
                .map(|e| e.state)
                .unwrap()
        };
        assert_eq!(state_of("v3"), AttemptState::Done);
        assert_eq!(state_of("v4"), AttemptState::Failed);
    }

    #[tokio::test]
    async fn reregistered_watcher_closes_the_session_that_sent_the_request() {
        let bus = MessageBus::default();
        let old = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let fresh = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(old.clone(), "11".into());
        let mut pending = d.dispatch(&near_berlin()).await;

        assert!(!d.register(fresh.clone(), "11".into()));
        bus.publish("C2G/P2P/w1", json!({"eventType": "BOOKING_RESPONSE"}))
            .unwrap();
        let outcome = pending.pop().unwrap().await;
        assert_eq!(outcome.outcome, ResponseOutcome::Concluded);
        d.on_outcome(outcome).await;

        assert_eq!(old.client().close_count(), 1);
        assert!(
            old.client()
                .journal()
                .unsubscribed
                .contains(&"C2G/P2P/w1".to_string())
        );
        assert_eq!(fresh.client().close_count(), 1);
        assert!(d.registry().is_empty());
    }

    #[tokio::test]
    async fn subscribe_failure_skips_publish() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        w1.client().set_fail_subscribes(true);
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());

        assert!(d.dispatch(&near_berlin()).await.is_empty());
        assert!(w1.client().journal().published.is_empty());
        let entries = d.ledger().unwrap().list_all().unwrap();
        assert_eq!(entries[0].state, AttemptState::Failed);
    }

    #[tokio::test]
    async fn unregister_aborts_outstanding_waits_without_closing() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());
        let mut pending = d.dispatch(&near_berlin()).await;

        assert!(d.unregister(&"w1".into()).await);
        let outcome = pending.pop().unwrap().await;
        assert_eq!(outcome.outcome, ResponseOutcome::Aborted);
        d.on_outcome(outcome).await;
        assert_eq!(w1.client().close_count(), 0);
        assert!(!d.unregister(&"w1".into()).await);
    }

    #[tokio::test]
    async fn disconnected_agent_is_dropped_without_close() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Broadcast);
        d.register(w1.clone(), "11".into());
        let _pending = d.dispatch(&near_berlin()).await;

        assert!(d.agent_disconnected(&"w1".into()));
        assert_eq!(d.in_flight(), 0);
        assert_eq!(w1.client().close_count(), 0);
        assert!(w1.client().journal().unsubscribed.is_empty());
    }

    #[tokio::test]
    async fn proximity_mode_skips_distant_watchers() {
        let bus = MessageBus::default();
        let w1 = Arc::new(LoopbackSession::new(bus.clone(), "w1"));
        let mut d = dispatcher(DispatchMode::Proximity { radius_m: 150.0 });
        d.register(w1.clone(), "11".into());
        let far = VehicleDelta::at("v5", 48.85, 2.35);
        assert!(d.dispatch(&far).await.is_empty());
        assert!(w1.client().journal().published.is_empty());
    }
}
