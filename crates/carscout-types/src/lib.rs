//! `carscout-types` – shared vocabulary of the CarScout workspace.
//!
//! Holds the identifiers, feed payloads, reservation bookkeeping records,
//! the bus [`Message`] envelope, and the workspace-wide [`ScoutError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// `eventType` value that concludes a booking transaction on a private
/// agent channel.
pub const BOOKING_RESPONSE: &str = "BOOKING_RESPONSE";

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of a watching agent (the account's client id on the broker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a watchable location (e.g. a parking lot number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocationId(String);

impl LocationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wire representation used in booking requests.
    ///
    /// The booking authority keys locations numerically, so purely numeric
    /// identifiers are emitted as JSON numbers; anything else stays a string.
    pub fn to_wire(&self) -> Value {
        match self.0.parse::<u64>() {
            Ok(n) => Value::from(n),
            Err(_) => Value::String(self.0.clone()),
        }
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for LocationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Geography
// ─────────────────────────────────────────────────────────────────────────────

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// True when both components are finite and inside the WGS-84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A vehicle position held by the spatial index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehiclePoint {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl VehiclePoint {
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
        }
    }

    pub fn coordinate(&self) -> GeoCoordinate {
        GeoCoordinate::new(self.latitude, self.longitude)
    }
}

/// Coordinates of a watchable location, as configured by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPoint {
    pub id: LocationId,
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationPoint {
    pub fn new(id: impl Into<LocationId>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
        }
    }

    pub fn to_point(&self) -> VehiclePoint {
        VehiclePoint::new(self.id.as_str(), self.latitude, self.longitude)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Feed payloads
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of a full vehicle-list snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub id: String,
    pub geo_coordinate: GeoCoordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VehicleRecord {
    pub fn to_point(&self) -> VehiclePoint {
        VehiclePoint::new(
            self.id.clone(),
            self.geo_coordinate.latitude,
            self.geo_coordinate.longitude,
        )
    }
}

/// Payload of the `VEHICLELIST` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleListPayload {
    pub connected_vehicles: Vec<VehicleRecord>,
}

impl VehicleListPayload {
    /// Reject snapshots carrying out-of-range coordinates.
    pub fn validate(&self, channel: &str) -> Result<(), ScoutError> {
        match self
            .connected_vehicles
            .iter()
            .find(|v| !v.geo_coordinate.is_valid())
        {
            Some(bad) => Err(ScoutError::MalformedPayload {
                channel: channel.to_string(),
                reason: format!("vehicle {} has an invalid geoCoordinate", bad.id),
            }),
            None => Ok(()),
        }
    }
}

/// A vehicle that was added to (or removed from) availability.
///
/// The position may arrive flat (`latitude` / `longitude`) or nested under
/// `geoCoordinate`; every other field is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDelta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_coordinate: Option<GeoCoordinate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl VehicleDelta {
    /// Build a delta entry with a flat position and no address.
    pub fn at(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            address: None,
            geo_coordinate: None,
            latitude: Some(latitude),
            longitude: Some(longitude),
            extra: Map::new(),
        }
    }

    /// The vehicle's position, preferring the nested `geoCoordinate` form.
    pub fn position(&self) -> Option<GeoCoordinate> {
        if let Some(geo) = self.geo_coordinate {
            return Some(geo);
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(GeoCoordinate::new(lat, lon)),
            _ => None,
        }
    }

    pub fn to_point(&self) -> Option<VehiclePoint> {
        self.position()
            .map(|geo| VehiclePoint::new(self.id.clone(), geo.latitude, geo.longitude))
    }
}

/// A `removedVehicles` entry: either a bare id or a full vehicle object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemovedVehicle {
    Id(String),
    Vehicle(VehicleDelta),
}

impl RemovedVehicle {
    pub fn id(&self) -> &str {
        match self {
            RemovedVehicle::Id(id) => id,
            RemovedVehicle::Vehicle(v) => &v.id,
        }
    }
}

/// Payload of the `VEHICLELISTDELTA` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDeltaPayload {
    pub added_vehicles: Vec<VehicleDelta>,
    #[serde(default)]
    pub removed_vehicles: Vec<RemovedVehicle>,
}

impl VehicleDeltaPayload {
    /// Reject deltas whose added vehicles carry out-of-range coordinates.
    /// Entries without a position are accepted.
    pub fn validate(&self, channel: &str) -> Result<(), ScoutError> {
        match self
            .added_vehicles
            .iter()
            .find(|v| v.position().is_some_and(|geo| !geo.is_valid()))
        {
            Some(bad) => Err(ScoutError::MalformedPayload {
                channel: channel.to_string(),
                reason: format!("added vehicle {} has an invalid position", bad.id),
            }),
            None => Ok(()),
        }
    }
}

/// An event received on an agent's private `P2P` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub event_type: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AgentEvent {
    /// True for the single terminal event type of a booking exchange.
    ///
    /// The event carries no success/failure discriminant the core can rely
    /// on; it only marks the transaction as concluded.
    pub fn is_booking_response(&self) -> bool {
        self.event_type == BOOKING_RESPONSE
    }
}

/// Outbound `REQUESTBOOKING` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub location_id: Value,
    pub target_vehicle: String,
    /// Seconds since the Unix epoch; doubles as the request token.
    pub timestamp: i64,
}

impl BookingRequest {
    pub fn new(location: &LocationId, target_vehicle: impl Into<String>, timestamp: i64) -> Self {
        Self {
            location_id: location.to_wire(),
            target_vehicle: target_vehicle.into(),
            timestamp,
        }
    }
}

/// Decode a JSON payload received on `channel` into `T`.
///
/// Any missing or mistyped field is reported as
/// [`ScoutError::MalformedPayload`] so the caller can skip just this event.
pub fn decode_payload<T: DeserializeOwned>(channel: &str, payload: &Value) -> Result<T, ScoutError> {
    T::deserialize(payload).map_err(|e| ScoutError::MalformedPayload {
        channel: channel.to_string(),
        reason: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Reservation bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a single reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    /// Intent logged; nothing published yet.
    Pending,
    /// Request published; awaiting the private-channel response.
    Dispatched,
    /// A terminal `BOOKING_RESPONSE` concluded the transaction.
    Done,
    /// No response arrived within the configured wait.
    TimedOut,
    /// Subscribe or publish failed at the transport.
    Failed,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Pending => "pending",
            AttemptState::Dispatched => "dispatched",
            AttemptState::Done => "done",
            AttemptState::TimedOut => "timed_out",
            AttemptState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptState::Pending),
            "dispatched" => Some(AttemptState::Dispatched),
            "done" => Some(AttemptState::Done),
            "timed_out" => Some(AttemptState::TimedOut),
            "failed" => Some(AttemptState::Failed),
            _ => None,
        }
    }

    /// True once the attempt can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Done | AttemptState::TimedOut | AttemptState::Failed
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reservation request issued on behalf of a watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationAttempt {
    pub id: Uuid,
    pub agent: AgentId,
    pub location: LocationId,
    pub vehicle_id: String,
    pub requested_at: DateTime<Utc>,
    pub state: AttemptState,
}

impl ReservationAttempt {
    pub fn new(agent: AgentId, location: LocationId, vehicle_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent,
            location,
            vehicle_id: vehicle_id.into(),
            requested_at: Utc::now(),
            state: AttemptState::Pending,
        }
    }

    /// Request token sent with the booking request (seconds since epoch).
    pub fn request_token(&self) -> i64 {
        self.requested_at.timestamp()
    }

    pub fn booking_request(&self) -> BookingRequest {
        BookingRequest::new(&self.location, self.vehicle_id.clone(), self.request_token())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A message delivered on a string-addressed channel.
///
/// Payloads are already decompressed and deserialised into JSON by the
/// messaging collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub payload: Value,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            channel: channel.into(),
            payload,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type. Every variant is recoverable from the point of
/// view of the scanner loop: the offending event is logged and skipped.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoutError {
    #[error("Malformed payload on {channel}: {reason}")]
    MalformedPayload { channel: String, reason: String },

    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    #[error("Transport failure on {channel}: {details}")]
    Transport { channel: String, details: String },

    #[error("Reservation of {vehicle_id} for {agent} timed out")]
    ReservationTimeout { agent: AgentId, vehicle_id: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
