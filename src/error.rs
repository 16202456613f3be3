//! Error taxonomy for the protocol engine.
//!
//! One enum per bucket from the transport/discovery/codec/protocol/lifecycle
//! split, composed into the per-operation error types returned by the public
//! API (`ConnectError`, `CommandError`, `ProtocolError`).

use thiserror::Error;

use crate::model::EndpointRole;

/// Errors raised by the socket manager.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {role:?} endpoint on port {port}: {source}")]
    PortBindFailed {
        role: EndpointRole,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("send failed on {role:?} endpoint: {source}")]
    SendFailed {
        role: EndpointRole,
        #[source]
        source: std::io::Error,
    },

    #[error("receive on {0:?} endpoint timed out")]
    RecvTimeout(EndpointRole),

    #[error("socket manager is not running")]
    NotRunning,
}

/// Errors raised during device discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery timed out after all retries")]
    Timeout,

    #[error("discovery response was malformed: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by the XML codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("XML payload of {size} bytes exceeds the {max} byte limit")]
    XmlTooLarge { size: usize, max: usize },

    #[error("malformed XML: {detail} (payload: {snippet:?})")]
    XmlMalformed { detail: String, snippet: String },

    #[error("unrecognised root element: {0}")]
    UnknownRoot(String),
}

/// Errors raised by the command/subscription/update round-trips.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("ack for command {0:?} timed out after all retries")]
    AckTimeout(String),

    #[error("device NAKed command {0:?}")]
    Nak(String),

    #[error("unexpected response on control channel: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Errors raised by the controller's lifecycle state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("engine is already connected")]
    AlreadyConnected,

    #[error("engine is not connected")]
    NotConnected,

    #[error("a close is already in progress")]
    ClosingInProgress,
}

/// Error returned by [`crate::Engine::connect`] / [`crate::Controller::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Error returned by [`crate::Engine::send_command`] / `send_commands`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("command name {0:?} is not a valid ASCII identifier")]
    InvalidCommandName(String),
}

impl From<CodecError> for CommandError {
    fn from(e: CodecError) -> Self {
        CommandError::Protocol(ProtocolError::Codec(e))
    }
}
