//! Asynchronous client library for Emotiva XMC-series A/V processors'
//! UDP/XML LAN control protocol (versions 2.0, 3.0, 3.1).
//!
//! The [`Engine`] facade owns discovery, the command/ack protocol engine,
//! the notification dispatcher, and the keepalive monitor behind one
//! connection state machine. Everything else in this crate is the plumbing
//! behind that facade and is exposed mainly for testing and advanced use.

pub mod codec;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod model;
pub mod protocol;
pub mod stats;
pub mod transport;

pub use config::{ConfigError, EngineConfig};
pub use controller::Engine;
pub use dispatch::{DispatchEvent, Registration};
pub use error::{CodecError, CommandError, ConnectError, DiscoveryError, LifecycleError, ProtocolError, TransportError};
pub use model::{
    AckResult, AckStatus, Command, ConnectionState, DeviceDescriptor, EndpointRole, PropertyAck,
    PropertyEvent, PropertyName, ProtocolVersion,
};
pub use stats::EngineStats;
