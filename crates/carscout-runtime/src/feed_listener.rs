//! [`FeedListener`] – keeps the vehicle index in step with the feed.
//!
//! ```text
//!   UNINITIALIZED ──snapshot──▶ READY ──delta──▶ STREAMING
//!                                 ▲                  │
//!                                 └──── snapshot ────┘ (index replaced, stays STREAMING)
//! ```
//!
//! The listener is pure state: it decodes payloads, rebuilds the
//! [`SpatialIndex`] and hands added vehicles back to the caller.  It never
//! touches the transport.

use std::collections::HashSet;

use carscout_spatial::SpatialIndex;
use carscout_types::{
    ScoutError, VehicleDelta, VehicleDeltaPayload, VehicleListPayload, VehiclePoint,
    decode_payload,
};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// No snapshot received yet; deltas are rejected.
    Uninitialized,
    /// Index built from a snapshot; no delta applied yet.
    Ready,
    /// At least one delta applied.
    Streaming,
}

impl FeedState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedState::Uninitialized => "uninitialized",
            FeedState::Ready => "ready",
            FeedState::Streaming => "streaming",
        }
    }
}

/// Result of ingesting a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// Number of vehicles in the new index.
    pub vehicles: usize,
    /// The snapshot channel should be released now.
    pub unsubscribe: bool,
}

/// Result of applying a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaOutcome {
    /// Added vehicles, in payload order, for the dispatcher.
    pub added: Vec<VehicleDelta>,
    /// Removed vehicles that were present in the index and got evicted.
    pub evicted: usize,
}

pub struct FeedListener {
    index: Option<SpatialIndex>,
    state: FeedState,
    resnapshot: bool,
}

impl FeedListener {
    /// `resnapshot = false` releases the snapshot channel after the first
    /// snapshot.
    pub fn new(resnapshot: bool) -> Self {
        Self {
            index: None,
            state: FeedState::Uninitialized,
            resnapshot,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    /// The current index, if a snapshot has arrived.
    pub fn index(&self) -> Option<&SpatialIndex> {
        self.index.as_ref()
    }

    pub fn indexed_vehicles(&self) -> usize {
        self.index.as_ref().map_or(0, SpatialIndex::len)
    }

    /// Up to `k` indexed vehicles nearest to `(latitude, longitude)`.
    pub fn nearest(&self, latitude: f64, longitude: f64, k: usize) -> Vec<VehiclePoint> {
        match &self.index {
            Some(index) => index.nearest(&VehiclePoint::new("", latitude, longitude), k),
            None => Vec::new(),
        }
    }

    /// Replace the index with the vehicles in a `VEHICLELIST` payload.
    ///
    /// A malformed payload leaves the current index and state untouched.
    pub fn handle_snapshot(
        &mut self,
        channel: &str,
        payload: &Value,
    ) -> Result<SnapshotOutcome, ScoutError> {
        let snapshot: VehicleListPayload = decode_payload(channel, payload)?;
        snapshot.validate(channel)?;

        let points = snapshot
            .connected_vehicles
            .iter()
            .map(|v| v.to_point())
            .collect::<Vec<_>>();
        let index = SpatialIndex::build(points);
        let vehicles = index.len();
        let replaced = self.index.replace(index).is_some();
        if self.state == FeedState::Uninitialized {
            self.state = FeedState::Ready;
        }
        info!(vehicles, replaced, state = self.state.as_str(), "vehicle snapshot indexed");

        Ok(SnapshotOutcome {
            vehicles,
            unsubscribe: !self.resnapshot,
        })
    }

    /// Apply a `VEHICLELISTDELTA` payload.
    ///
    /// Returns [`ScoutError::OrderingViolation`] when no snapshot has been
    /// received yet.  A malformed payload (including out-of-range positions)
    /// leaves the index and state untouched.
    pub fn handle_delta(&mut self, channel: &str, payload: &Value) -> Result<DeltaOutcome, ScoutError> {
        let Some(index) = self.index.as_ref() else {
            return Err(ScoutError::OrderingViolation(format!(
                "delta on {channel} received before any vehicle snapshot"
            )));
        };
        let delta: VehicleDeltaPayload = decode_payload(channel, payload)?;
        delta.validate(channel)?;

        let removed: HashSet<String> = delta
            .removed_vehicles
            .iter()
            .map(|r| r.id().to_string())
            .filter(|id| index.contains(id))
            .collect();
        let evicted = removed.len();
        if evicted > 0 {
            let rebuilt = index.without(&removed);
            self.index = Some(rebuilt);
        }
        self.state = FeedState::Streaming;
        debug!(
            added = delta.added_vehicles.len(),
            removed = delta.removed_vehicles.len(),
            evicted,
            "vehicle delta applied"
        );

        Ok(DeltaOutcome {
            added: delta.added_vehicles,
            evicted,
        })
    }
}

impl Default for FeedListener {
    fn default() -> Self {
        Self::new(false)
    }
}
