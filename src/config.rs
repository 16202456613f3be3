//! Engine configuration.
//!
//! Supports both programmatic construction (builder methods) and
//! file-based configuration, mirroring the teacher crate's
//! `RouterConfig`/`RouteConfig` pair.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{PropertyName, ProtocolVersion};

/// Errors raised while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Caller-provided engine configuration (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Device host, as an IP literal (discovery replies from other hosts
    /// are filtered out once this is set).
    pub host: IpAddr,

    #[serde(default)]
    pub protocol_pref: ConfiguredProtocolVersion,

    #[serde(default = "default_discover_request_port")]
    pub discover_request_port: u16,

    #[serde(default = "default_discover_response_port")]
    pub discover_response_port: u16,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u8,

    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u32,

    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u32,

    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent_commands: u8,

    #[serde(default = "default_callback_timeout_ms")]
    pub callback_timeout_ms: u32,

    #[serde(default = "default_keepalive_grace_ms")]
    pub keepalive_grace_ms: u32,

    #[serde(default = "default_max_xml_bytes")]
    pub max_xml_bytes: u32,

    #[serde(default)]
    pub default_subscriptions: BTreeSet<PropertyName>,

    /// Base delay for the reconnect backoff run after a keepalive timeout or
    /// `goodbye` (spec section 4.6's "caller-configurable cap"; open question,
    /// resolved in DESIGN.md by reusing the same base/jitter shape as command
    /// retry backoff).
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u32,

    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u32,

    /// Cap on reconnect attempts; `0` means retry indefinitely.
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

/// Thin serde wrapper so `ProtocolVersion` can be the `protocol_pref` default
/// without forcing every other user of [`ProtocolVersion`] through serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfiguredProtocolVersion(pub ProtocolVersion);

impl Default for ConfiguredProtocolVersion {
    fn default() -> Self {
        ConfiguredProtocolVersion(ProtocolVersion::V3_1)
    }
}

fn default_discover_request_port() -> u16 {
    7000
}
fn default_discover_response_port() -> u16 {
    7001
}
fn default_ack_timeout_ms() -> u32 {
    2000
}
fn default_max_retries() -> u8 {
    3
}
fn default_retry_base_ms() -> u32 {
    100
}
fn default_retry_max_ms() -> u32 {
    2000
}
fn default_max_concurrent_commands() -> u8 {
    5
}
fn default_callback_timeout_ms() -> u32 {
    5000
}
fn default_keepalive_grace_ms() -> u32 {
    5000
}
fn default_max_xml_bytes() -> u32 {
    65536
}
fn default_reconnect_base_ms() -> u32 {
    1000
}
fn default_reconnect_max_ms() -> u32 {
    30_000
}

impl EngineConfig {
    /// Minimal configuration with every other field defaulted.
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            protocol_pref: ConfiguredProtocolVersion::default(),
            discover_request_port: default_discover_request_port(),
            discover_response_port: default_discover_response_port(),
            ack_timeout_ms: default_ack_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            max_concurrent_commands: default_max_concurrent_commands(),
            callback_timeout_ms: default_callback_timeout_ms(),
            keepalive_grace_ms: default_keepalive_grace_ms(),
            max_xml_bytes: default_max_xml_bytes(),
            default_subscriptions: BTreeSet::new(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: 0,
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Add a property to the set subscribed automatically on connect.
    pub fn with_default_subscription(mut self, name: impl Into<PropertyName>) -> Self {
        self.default_subscriptions.insert(name.into());
        self
    }

    pub fn with_max_concurrent_commands(mut self, n: u8) -> Self {
        self.max_concurrent_commands = n;
        self
    }

    pub fn with_max_retries(mut self, n: u8) -> Self {
        self.max_retries = n;
        self
    }

    /// Validate the configuration, independent of any live device.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_commands == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_commands must be > 0".into(),
            ));
        }
        if self.max_xml_bytes == 0 {
            return Err(ConfigError::Invalid("max_xml_bytes must be > 0".into()));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid("ack_timeout_ms must be > 0".into()));
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::Invalid("retry_base_ms must be > 0".into()));
        }
        if self.retry_max_ms < self.retry_base_ms {
            return Err(ConfigError::Invalid(
                "retry_max_ms must be >= retry_base_ms".into(),
            ));
        }
        if self.discover_request_port == self.discover_response_port {
            return Err(ConfigError::Invalid(
                "discover_request_port and discover_response_port must differ".into(),
            ));
        }
        if self.reconnect_max_ms < self.reconnect_base_ms {
            return Err(ConfigError::Invalid(
                "reconnect_max_ms must be >= reconnect_base_ms".into(),
            ));
        }
        for name in &self.default_subscriptions {
            crate::model::Command::validate_name(name).map_err(|_| {
                ConfigError::Invalid(format!("invalid default subscription name {name:?}"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50))
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = EngineConfig::new(host());
        assert_eq!(cfg.discover_request_port, 7000);
        assert_eq!(cfg.discover_response_port, 7001);
        assert_eq!(cfg.ack_timeout_ms, 2000);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_base_ms, 100);
        assert_eq!(cfg.retry_max_ms, 2000);
        assert_eq!(cfg.max_concurrent_commands, 5);
        assert_eq!(cfg.callback_timeout_ms, 5000);
        assert_eq!(cfg.keepalive_grace_ms, 5000);
        assert_eq!(cfg.max_xml_bytes, 65536);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let cfg = EngineConfig::new(host()).with_max_concurrent_commands(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_invalid_default_subscription() {
        let mut cfg = EngineConfig::new(host());
        cfg.default_subscriptions.insert("bad-name".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_file_parses_toml() {
        let toml_str = r#"
            host = "10.0.0.5"
            ack_timeout_ms = 500
            default_subscriptions = ["volume", "power"]
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, toml_str).unwrap();
        let cfg = EngineConfig::from_file(&path).unwrap();
        assert_eq!(cfg.ack_timeout_ms, 500);
        assert_eq!(cfg.max_retries, 3); // default
        assert!(cfg.default_subscriptions.contains("volume"));
    }
}
