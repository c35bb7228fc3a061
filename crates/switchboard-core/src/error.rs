//! Error types for the routing core.

use switchboard_protocol::ProtocolError;
use switchboard_transport::{ConnectionId, TransportError};
use thiserror::Error;

/// Errors raised by event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A positional argument was missing or had the wrong shape.
    #[error("Invalid argument {index}: {reason}")]
    InvalidArgument {
        /// Position of the argument.
        index: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The handler gave up.
    #[error("{0}")]
    Failed(String),

    /// JSON conversion failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An outgoing frame could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),

    /// Sending to the originating connection failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl HandlerError {
    /// Create a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors returned by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The namespace has neither handlers nor a guard.
    #[error("Unknown namespace: {0:?}")]
    UnknownNamespace(String),

    /// The namespace guard rejected the event.
    #[error("Access denied to {event:?} in namespace {namespace:?}")]
    AccessDenied {
        /// Namespace of the rejected event.
        namespace: String,
        /// Rejected event name.
        event: String,
    },

    /// The socket already went through its disconnect lifecycle.
    #[error("Connection {sid} is disconnected from namespace {namespace:?}")]
    Disconnected {
        /// Connection the socket belonged to.
        sid: ConnectionId,
        /// Namespace of the socket.
        namespace: String,
    },

    /// The handler failed.
    #[error("Handler for {event:?} failed: {source}")]
    Handler {
        /// Event being handled.
        event: String,
        /// Underlying failure.
        #[source]
        source: HandlerError,
    },

    /// An outgoing frame could not be encoded.
    #[error("Encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

impl DispatchError {
    /// Machine readable name, used for `error` frames sent to clients.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DispatchError::UnknownNamespace(_) => "invalid_namespace",
            DispatchError::AccessDenied { .. } => "method_access_denied",
            DispatchError::Disconnected { .. } => "disconnected",
            DispatchError::Handler { .. } => "handler_error",
            DispatchError::Encode(_) => "encode_error",
        }
    }
}
