//! [`WatcherRegistry`] – who is waiting for a vehicle, and where.
//!
//! Each watching agent has at most one entry.  Registering again replaces
//! the watched location (upsert); retiring an agent removes its entry
//! outright, so a concluded watcher never lingers in the table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use carscout_middleware::AgentSession;
use carscout_types::{AgentId, LocationId};
use tracing::info;

/// Where a registered watcher is in its lifecycle.
///
/// Retired watchers are removed from the registry, so there is no `Done`
/// variant to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Registered; no reservation attempt issued yet.
    Pending,
    /// At least one reservation attempt has been issued.
    Dispatched,
}

/// A registered agent and the location it wants a vehicle at.
#[derive(Clone)]
pub struct Watcher {
    /// The agent's own messaging session; used to reserve on its behalf.
    pub session: Arc<dyn AgentSession>,
    pub location: LocationId,
    pub state: WatcherState,
}

impl Watcher {
    pub fn agent_id(&self) -> &AgentId {
        self.session.agent_id()
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher")
            .field("agent", self.agent_id())
            .field("location", &self.location)
            .field("state", &self.state)
            .finish()
    }
}

/// Agent → watcher table, ordered by agent id.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use carscout_kernel::registry::WatcherRegistry;
/// use carscout_middleware::{LoopbackSession, MessageBus};
///
/// let bus = MessageBus::default();
/// let mut registry = WatcherRegistry::new();
/// registry.register(Arc::new(LoopbackSession::new(bus.clone(), "w1")), "11".into());
/// registry.register(Arc::new(LoopbackSession::new(bus, "w1")), "11".into());
///
/// assert_eq!(registry.len(), 1);
/// ```
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: BTreeMap<AgentId, Watcher>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session`'s agent as watching `location`.
    ///
    /// Re-registering overwrites the location and session handle but keeps
    /// the lifecycle state.  Returns `true` when the agent was not known.
    pub fn register(&mut self, session: Arc<dyn AgentSession>, location: LocationId) -> bool {
        let agent = session.agent_id().clone();
        info!(agent = %agent, location = %location, "watcher requests location");
        match self.watchers.get_mut(&agent) {
            Some(existing) => {
                existing.session = session;
                existing.location = location;
                false
            }
            None => {
                self.watchers.insert(
                    agent,
                    Watcher {
                        session,
                        location,
                        state: WatcherState::Pending,
                    },
                );
                true
            }
        }
    }

    /// Remove `agent`'s entry.  No-ops when absent.
    pub fn unregister(&mut self, agent: &AgentId) -> Option<Watcher> {
        self.watchers.remove(agent)
    }

    /// Flag `agent` as having an attempt in flight.
    pub fn mark_dispatched(&mut self, agent: &AgentId) {
        if let Some(watcher) = self.watchers.get_mut(agent) {
            watcher.state = WatcherState::Dispatched;
        }
    }

    pub fn get(&self, agent: &AgentId) -> Option<&Watcher> {
        self.watchers.get(agent)
    }

    pub fn contains(&self, agent: &AgentId) -> bool {
        self.watchers.contains_key(agent)
    }

    /// Snapshot of all current registrations, ordered by agent id.
    pub fn list(&self) -> Vec<Watcher> {
        self.watchers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }
}
