//! Channel naming.
//!
//! | Channel | Direction |
//! |---|---|
//! | `<prefix>/VEHICLELIST<suffix>` | inbound, one-shot snapshot |
//! | `<prefix>/VEHICLELISTDELTA<suffix>` | inbound, recurring deltas |
//! | `<prefix>/P2P/{agentId}<suffix>` | inbound, per-agent responses |
//! | `<prefix>/C2S/{locationId}/{agentId}/REQUESTBOOKING` | outbound |
//!
//! The suffix mirrors how the upstream broker tags compressed topics
//! (e.g. `.GZ`); outbound requests never carry it.

use carscout_types::{AgentId, LocationId};

/// Renders every channel address from a common prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelScheme {
    prefix: String,
    suffix: String,
}

impl ChannelScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
            suffix: String::new(),
        }
    }

    /// Append `suffix` to every inbound channel.
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn vehicle_list(&self) -> String {
        format!("{}/VEHICLELIST{}", self.prefix, self.suffix)
    }

    pub fn vehicle_delta(&self) -> String {
        format!("{}/VEHICLELISTDELTA{}", self.prefix, self.suffix)
    }

    /// The agent's private response channel.
    pub fn private(&self, agent: &AgentId) -> String {
        format!("{}/P2P/{}{}", self.prefix, agent, self.suffix)
    }

    pub fn request_booking(&self, location: &LocationId, agent: &AgentId) -> String {
        format!("{}/C2S/{}/{}/REQUESTBOOKING", self.prefix, location, agent)
    }
}

impl Default for ChannelScheme {
    fn default() -> Self {
        Self::new("C2G")
    }
}
