//! Core data model shared by every component (spec section 3).

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// One of the four UDP endpoints the engine owns while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    DiscoverReq,
    DiscoverResp,
    Control,
    Notify,
}

impl EndpointRole {
    pub const ALL: [EndpointRole; 4] = [
        EndpointRole::DiscoverReq,
        EndpointRole::DiscoverResp,
        EndpointRole::Control,
        EndpointRole::Notify,
    ];
}

/// Protocol revision advertised by the device / requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "2.0")]
    V2_0,
    #[serde(rename = "3.0")]
    V3_0,
    #[serde(rename = "3.1")]
    V3_1,
}

impl ProtocolVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V2_0 => "2.0",
            ProtocolVersion::V3_0 => "3.0",
            ProtocolVersion::V3_1 => "3.1",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "2.0" => Some(ProtocolVersion::V2_0),
            "3.0" => Some(ProtocolVersion::V3_0),
            "3.1" => Some(ProtocolVersion::V3_1),
            _ => None,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V3_1
    }
}

/// Result of a successful discovery exchange. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub model: String,
    pub revision: String,
    pub name: String,
    pub protocol_version: ProtocolVersion,
    pub control_port: u16,
    pub notify_port: u16,
    pub keepalive_interval_ms: u32,
}

impl DeviceDescriptor {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms as u64)
    }
}

/// An opaque property name (e.g. `power`, `volume`, `zone2_power`).
pub type PropertyName = String;

/// A single command to send on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub value: String,
    pub ack_required: bool,
}

impl Command {
    pub fn new(name: impl Into<String>, value: impl Into<String>, ack_required: bool) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            ack_required,
        }
    }

    /// `[a-zA-Z_][a-zA-Z0-9_]*`, checked with no regex dependency.
    pub fn validate_name(name: &str) -> Result<(), CommandError> {
        let mut chars = name.chars();
        let ok = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(CommandError::InvalidCommandName(name.to_string()))
        }
    }
}

/// Ack/nak status for a single command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Ack,
    Nak,
}

/// Outcome of a single command within an `emotivaAck` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResult {
    pub name: String,
    pub status: AckStatus,
}

/// A property-change notification, normalised to the v3 shape regardless of
/// whether the device spoke v2 or v3 on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyEvent {
    pub name: PropertyName,
    pub value: String,
    pub visible: bool,
    pub seq: u32,
}

/// A single property entry inside a subscribe/unsubscribe/update response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyAck {
    pub name: PropertyName,
    pub status: AckStatus,
    pub value: Option<String>,
    pub visible: Option<bool>,
}

/// Lifecycle state of the controller facade (spec section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Closing,
    Closed,
}

/// The authoritative set of subscribed property names, owned by the
/// controller. Wraps a `BTreeSet` so iteration order is deterministic,
/// which keeps tests (and wire traffic) reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet(BTreeSet<PropertyName>);

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    pub fn insert(&mut self, name: PropertyName) -> bool {
        self.0.insert(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyName> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn snapshot(&self) -> BTreeSet<PropertyName> {
        self.0.clone()
    }

    /// Names from `requested` that are not already subscribed.
    pub fn not_yet_subscribed<'a>(
        &self,
        requested: impl IntoIterator<Item = &'a PropertyName>,
    ) -> Vec<PropertyName> {
        requested
            .into_iter()
            .filter(|n| !self.0.contains(*n))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_validation() {
        assert!(Command::validate_name("power").is_ok());
        assert!(Command::validate_name("zone2_power").is_ok());
        assert!(Command::validate_name("_ok").is_ok());
        assert!(Command::validate_name("2power").is_err());
        assert!(Command::validate_name("bad-name").is_err());
        assert!(Command::validate_name("").is_err());
    }

    #[test]
    fn protocol_version_roundtrip() {
        for v in ["2.0", "3.0", "3.1"] {
            assert_eq!(ProtocolVersion::parse(v).unwrap().as_str(), v);
        }
        assert!(ProtocolVersion::parse("9.9").is_none());
    }

    #[test]
    fn subscription_set_dedup() {
        let mut set = SubscriptionSet::new();
        assert!(set.insert("volume".to_string()));
        assert!(!set.insert("volume".to_string()));
        assert_eq!(set.len(), 1);
        assert!(set.remove("volume"));
        assert!(set.is_empty());
    }

    #[test]
    fn not_yet_subscribed_filters_existing() {
        let mut set = SubscriptionSet::new();
        set.insert("volume".to_string());
        let requested = vec!["volume".to_string(), "power".to_string()];
        let fresh = set.not_yet_subscribed(&requested);
        assert_eq!(fresh, vec!["power".to_string()]);
    }
}
