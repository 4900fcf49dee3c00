//! `carscout-kernel` – Watchers & Matching
//!
//! Holds the state that decides who races for a vehicle.  It does no I/O; the
//! runtime drives it.
//!
//! # Modules
//!
//! - [`registry`] – [`WatcherRegistry`][registry::WatcherRegistry]:
//!   one entry per watching agent, holding its session handle and the
//!   location it wants a vehicle at.
//! - [`dispatch_policy`] – [`DispatchPolicy`][dispatch_policy::DispatchPolicy]:
//!   a rule engine that decides which watchers are eligible for a newly
//!   added vehicle (proximity to a known location, address equality, or
//!   plain broadcast).

pub mod dispatch_policy;
pub mod registry;

pub use dispatch_policy::{
    AddressRule, DispatchMode, DispatchPolicy, LocationCatalog, MatchRule, ProximityRule,
};
pub use registry::{Watcher, WatcherRegistry, WatcherState};
