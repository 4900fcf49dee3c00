//! [`DispatchPolicy`] – which watchers get a reservation attempt for a
//! newly added vehicle.
//!
//! Two modes exist:
//!
//! - [`DispatchMode::Proximity`] (default) – a watcher is eligible when any
//!   registered [`MatchRule`] accepts it.  The built-in rules are
//!   [`ProximityRule`] (the watched location lies within the configured
//!   radius of the vehicle) and [`AddressRule`] (the vehicle's reported
//!   address *is* the watched location).
//! - [`DispatchMode::Broadcast`] – every watcher is eligible regardless of
//!   distance.

use std::sync::Arc;

use carscout_spatial::{SpatialIndex, metres_to_radians};
use carscout_types::{LocationId, LocationPoint, VehicleDelta};
use tracing::debug;

use crate::registry::Watcher;

/// Default proximity radius.
pub const DEFAULT_RADIUS_M: f64 = 150.0;

// ────────────────────────────────────────────────────────────────────────────
// DispatchMode
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DispatchMode {
    /// Only watchers whose location matches the vehicle.
    Proximity { radius_m: f64 },
    /// Every registered watcher.
    Broadcast,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Proximity {
            radius_m: DEFAULT_RADIUS_M,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// LocationCatalog
// ────────────────────────────────────────────────────────────────────────────

/// Known coordinates of watchable locations, indexed for radius queries.
#[derive(Debug, Clone, Default)]
pub struct LocationCatalog {
    index: SpatialIndex,
}

impl LocationCatalog {
    pub fn new(locations: Vec<LocationPoint>) -> Self {
        Self {
            index: SpatialIndex::build(locations.iter().map(LocationPoint::to_point).collect()),
        }
    }

    pub fn contains(&self, location: &LocationId) -> bool {
        self.index.contains(location.as_str())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Locations within `radius` radians of `vehicle`, nearest first.
    /// Empty when the vehicle carries no position.
    pub fn near(&self, vehicle: &VehicleDelta, radius: f64) -> Vec<LocationId> {
        match vehicle.to_point() {
            Some(point) => self
                .index
                .within_radius(&point, radius)
                .into_iter()
                .map(|p| LocationId::from(p.id))
                .collect(),
            None => Vec::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rules
// ────────────────────────────────────────────────────────────────────────────

/// A single reason a watcher may be offered a vehicle.
pub trait MatchRule: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    fn matches(&self, watcher: &Watcher, vehicle: &VehicleDelta) -> bool;
}

/// Accepts watchers whose location has known coordinates within `radius` of
/// the vehicle.
pub struct ProximityRule {
    catalog: Arc<LocationCatalog>,
    radius: f64,
}

impl ProximityRule {
    pub fn new(catalog: Arc<LocationCatalog>, radius_m: f64) -> Self {
        Self {
            catalog,
            radius: metres_to_radians(radius_m),
        }
    }
}

impl MatchRule for ProximityRule {
    fn name(&self) -> &str {
        "proximity"
    }

    fn matches(&self, watcher: &Watcher, vehicle: &VehicleDelta) -> bool {
        self.catalog.contains(&watcher.location)
            && self
                .catalog
                .near(vehicle, self.radius)
                .contains(&watcher.location)
    }
}

/// Accepts watchers whose location id equals the vehicle's reported address.
pub struct AddressRule;

impl MatchRule for AddressRule {
    fn name(&self) -> &str {
        "address"
    }

    fn matches(&self, watcher: &Watcher, vehicle: &VehicleDelta) -> bool {
        vehicle.address.as_deref().map(str::trim) == Some(watcher.location.as_str())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DispatchPolicy
// ────────────────────────────────────────────────────────────────────────────

/// Selects the watchers that should race for a vehicle.
///
/// # Example
///
/// ```
/// use carscout_kernel::dispatch_policy::{DispatchMode, DispatchPolicy};
/// use carscout_types::LocationPoint;
///
/// let policy = DispatchPolicy::new(
///     DispatchMode::Proximity { radius_m: 200.0 },
///     vec![LocationPoint::new("11", 52.52, 13.405)],
/// );
/// assert!(policy.knows_location(&"11".into()));
/// ```
pub struct DispatchPolicy {
    mode: DispatchMode,
    catalog: Arc<LocationCatalog>,
    rules: Vec<Box<dyn MatchRule>>,
}

impl DispatchPolicy {
    /// Build a policy; proximity mode installs [`ProximityRule`] followed by
    /// [`AddressRule`].
    pub fn new(mode: DispatchMode, locations: Vec<LocationPoint>) -> Self {
        let catalog = Arc::new(LocationCatalog::new(locations));
        let rules: Vec<Box<dyn MatchRule>> = match mode {
            DispatchMode::Proximity { radius_m } => vec![
                Box::new(ProximityRule::new(Arc::clone(&catalog), radius_m)),
                Box::new(AddressRule),
            ],
            DispatchMode::Broadcast => Vec::new(),
        };
        Self {
            mode,
            catalog,
            rules,
        }
    }

    /// Every watcher, every vehicle.
    pub fn broadcast() -> Self {
        Self::new(DispatchMode::Broadcast, Vec::new())
    }

    /// Register an additional rule.  Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn MatchRule>) {
        self.rules.push(rule);
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// True when `location` has configured coordinates.
    pub fn knows_location(&self, location: &LocationId) -> bool {
        self.catalog.contains(location)
    }

    /// Name of the first rule accepting `watcher` for `vehicle`, or
    /// `Some("broadcast")` in broadcast mode.  `None` means "skip".
    pub fn matching_rule(&self, watcher: &Watcher, vehicle: &VehicleDelta) -> Option<&str> {
        match self.mode {
            DispatchMode::Broadcast => Some("broadcast"),
            DispatchMode::Proximity { .. } => self
                .rules
                .iter()
                .find(|rule| rule.matches(watcher, vehicle))
                .map(|rule| rule.name()),
        }
    }

    /// Watchers from `watchers` that should race for `vehicle`, in order.
    pub fn select(&self, watchers: &[Watcher], vehicle: &VehicleDelta) -> Vec<Watcher> {
        watchers
            .iter()
            .filter(|w| match self.matching_rule(w, vehicle) {
                Some(rule) => {
                    debug!(agent = %w.agent_id(), vehicle = %vehicle.id, rule, "watcher eligible");
                    true
                }
                None => {
                    debug!(agent = %w.agent_id(), vehicle = %vehicle.id, "watcher not eligible");
                    false
                }
            })
            .cloned()
            .collect()
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::new(DispatchMode::default(), Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WatcherState;
    use carscout_middleware::{AgentSession, LoopbackSession, MessageBus};

    fn watcher(agent: &str, location: &str) -> Watcher {
        let session: Arc<dyn AgentSession> =
            Arc::new(LoopbackSession::new(MessageBus::default(), agent));
        Watcher {
            session,
            location: location.into(),
            state: WatcherState::Pending,
        }
    }

    fn berlin_policy(radius_m: f64) -> DispatchPolicy {
        DispatchPolicy::new(
            DispatchMode::Proximity { radius_m },
            vec![
                LocationPoint::new("11", 52.52, 13.405),
                LocationPoint::new("22", 48.85, 2.35),
            ],
        )
    }

    #[test]
    fn proximity_accepts_nearby_location() {
        let policy = berlin_policy(200.0);
        let v3 = VehicleDelta::at("v3", 52.521, 13.406);
        assert_eq!(policy.matching_rule(&watcher("w1", "11"), &v3), Some("proximity"));
    }

    #[test]
    fn proximity_rejects_distant_location() {
        let policy = berlin_policy(200.0);
        let v3 = VehicleDelta::at("v3", 52.521, 13.406);
        assert_eq!(policy.matching_rule(&watcher("w2", "22"), &v3), None);
    }

    #[test]
    fn address_rule_covers_locations_without_coordinates() {
        let policy = berlin_policy(200.0);
        let mut v = VehicleDelta::at("v7", 0.0, 0.0);
        v.address = Some("Hauptbahnhof".to_string());
        assert!(!policy.knows_location(&"Hauptbahnhof".into()));
        assert_eq!(
            policy.matching_rule(&watcher("w3", "Hauptbahnhof"), &v),
            Some("address")
        );
    }

    #[test]
    fn vehicle_without_position_only_matches_by_address() {
        let policy = berlin_policy(200.0);
        let mut v = VehicleDelta::at("v8", 0.0, 0.0);
        v.latitude = None;
        v.longitude = None;
        assert_eq!(policy.matching_rule(&watcher("w1", "11"), &v), None);
    }

    #[test]
    fn broadcast_accepts_everyone() {
        let policy = DispatchPolicy::broadcast();
        let v = VehicleDelta::at("v3", -33.86, 151.2);
        let watchers = vec![watcher("w1", "11"), watcher("w2", "nowhere")];
        assert_eq!(policy.select(&watchers, &v).len(), 2);
        assert_eq!(policy.mode(), DispatchMode::Broadcast);
    }

    #[test]
    fn select_keeps_only_matching_watchers() {
        let policy = berlin_policy(200.0);
        let v3 = VehicleDelta::at("v3", 52.521, 13.406);
        let watchers = vec![watcher("w1", "11"), watcher("w2", "22")];
        let chosen = policy.select(&watchers, &v3);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].agent_id().as_str(), "w1");
    }

    #[test]
    fn custom_rules_extend_proximity_mode() {
        struct Everyone;
        impl MatchRule for Everyone {
            fn name(&self) -> &str {
                "everyone"
            }
            fn matches(&self, _: &Watcher, _: &VehicleDelta) -> bool {
                true
            }
        }
        let mut policy = berlin_policy(200.0);
        policy.add_rule(Box::new(Everyone));
        let far = VehicleDelta::at("v9", -33.86, 151.2);
        assert_eq!(policy.matching_rule(&watcher("w2", "22"), &far), Some("everyone"));
    }

    #[test]
    fn catalog_near_returns_locations_nearest_first() {
        let catalog = LocationCatalog::new(vec![
            LocationPoint::new("far", 52.53, 13.42),
            LocationPoint::new("close", 52.5211, 13.4061),
        ]);
        let v = VehicleDelta::at("v", 52.521, 13.406);
        let near = catalog.near(&v, metres_to_radians(5_000.0));
        assert_eq!(near, vec![LocationId::from("close"), LocationId::from("far")]);
    }
}
