//! Frame types for the Switchboard protocol.
//!
//! Frames are the fundamental unit of communication between a client and
//! the server. Every frame except the handshake and keepalives is scoped to
//! a namespace; the default namespace is the empty string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version, announced in the `connected` handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// The default namespace.
pub const DEFAULT_NAMESPACE: &str = "";

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Connect,
    Connected,
    Disconnect,
    Event,
    Message,
    Json,
    Ack,
    Error,
    Ping,
    Pong,
}

impl FrameType {
    /// Short lowercase name, used as a log field and metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Disconnect => "disconnect",
            FrameType::Event => "event",
            FrameType::Message => "message",
            FrameType::Json => "json",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Activate a namespace on this connection.
    #[serde(rename = "connect")]
    Connect {
        /// Namespace to activate.
        namespace: String,
    },

    /// Handshake response, sent once per physical connection.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Protocol version spoken by the server.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Leave a namespace (client) or notify that it was closed (server).
    #[serde(rename = "disconnect")]
    Disconnect {
        /// Namespace being closed.
        namespace: String,
    },

    /// A named event with positional arguments.
    #[serde(rename = "event")]
    Event {
        /// Namespace the event belongs to.
        namespace: String,
        /// Event name.
        event: String,
        /// Positional arguments.
        #[serde(default)]
        args: Vec<Value>,
        /// Optional request ID; when present the server answers with an ack.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Plain text payload.
    #[serde(rename = "message")]
    Message {
        namespace: String,
        data: String,
        /// Optional request ID, answered with an ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Structured payload.
    #[serde(rename = "json")]
    Json {
        namespace: String,
        data: Value,
        /// Optional request ID, answered with an ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Acknowledgment of an event that carried an ID.
    #[serde(rename = "ack")]
    Ack {
        namespace: String,
        /// ID of the acknowledged event.
        id: u64,
        /// Values returned by the handler.
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Structured error report.
    #[serde(rename = "error")]
    Error {
        namespace: String,
        /// Machine readable error name.
        name: String,
        /// Human-readable error message.
        message: String,
        /// ID of the event that caused the error, if any.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Disconnect { .. } => FrameType::Disconnect,
            Frame::Event { .. } => FrameType::Event,
            Frame::Message { .. } => FrameType::Message,
            Frame::Json { .. } => FrameType::Json,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// The namespace a frame is scoped to, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Frame::Connect { namespace }
            | Frame::Disconnect { namespace }
            | Frame::Event { namespace, .. }
            | Frame::Message { namespace, .. }
            | Frame::Json { namespace, .. }
            | Frame::Ack { namespace, .. }
            | Frame::Error { namespace, .. } => Some(namespace),
            Frame::Connected { .. } | Frame::Ping { .. } | Frame::Pong { .. } => None,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(namespace: impl Into<String>) -> Self {
        Frame::Connect {
            namespace: namespace.into(),
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version: PROTOCOL_VERSION,
            heartbeat,
        }
    }

    /// Create a new Disconnect frame.
    #[must_use]
    pub fn disconnect(namespace: impl Into<String>) -> Self {
        Frame::Disconnect {
            namespace: namespace.into(),
        }
    }

    /// Create a new Event frame.
    #[must_use]
    pub fn event(namespace: impl Into<String>, event: impl Into<String>, args: Vec<Value>) -> Self {
        Frame::Event {
            namespace: namespace.into(),
            event: event.into(),
            args,
            id: None,
        }
    }

    /// Create a new Event frame that asks for an acknowledgment.
    #[must_use]
    pub fn event_with_ack(
        id: u64,
        namespace: impl Into<String>,
        event: impl Into<String>,
        args: Vec<Value>,
    ) -> Self {
        Frame::Event {
            namespace: namespace.into(),
            event: event.into(),
            args,
            id: Some(id),
        }
    }

    /// Create a new Message frame.
    #[must_use]
    pub fn message(namespace: impl Into<String>, data: impl Into<String>) -> Self {
        Frame::Message {
            namespace: namespace.into(),
            data: data.into(),
            id: None,
        }
    }

    /// Create a new Json frame.
    #[must_use]
    pub fn json(namespace: impl Into<String>, data: Value) -> Self {
        Frame::Json {
            namespace: namespace.into(),
            data,
            id: None,
        }
    }

    /// Ask the receiver to acknowledge this frame under `ack_id`.
    ///
    /// Only `event`, `message` and `json` frames carry an ID; other frames
    /// are returned unchanged.
    #[must_use]
    pub fn with_id(mut self, ack_id: u64) -> Self {
        match &mut self {
            Frame::Event { id, .. } | Frame::Message { id, .. } | Frame::Json { id, .. } => {
                *id = Some(ack_id);
            }
            _ => {}
        }
        self
    }

    /// The ID an `event`, `message` or `json` frame asks to be acknowledged
    /// under.
    #[must_use]
    pub fn ack_id(&self) -> Option<u64> {
        match self {
            Frame::Event { id, .. } | Frame::Message { id, .. } | Frame::Json { id, .. } => *id,
            _ => None,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(namespace: impl Into<String>, id: u64, args: Vec<Value>) -> Self {
        Frame::Ack {
            namespace: namespace.into(),
            id,
            args,
        }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(
        namespace: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
        id: Option<u64>,
    ) -> Self {
        Frame::Error {
            namespace: namespace.into(),
            name: name.into(),
            message: message.into(),
            id,
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let event = Frame::event("chat", "greet", vec![json!("hi")]);
        assert_eq!(event.frame_type(), FrameType::Event);
        assert_eq!(event.frame_type().to_string(), "event");

        let ping = Frame::ping();
        assert_eq!(ping.frame_type(), FrameType::Ping);
    }

    #[test]
    fn test_frame_namespace() {
        assert_eq!(Frame::connect("/chat").namespace(), Some("/chat"));
        assert_eq!(Frame::message("", "hello").namespace(), Some(""));
        assert_eq!(Frame::connected("conn-1", 25_000).namespace(), None);
    }

    #[test]
    fn test_connected_carries_protocol_version() {
        match Frame::connected("conn-1", 25_000) {
            Frame::Connected { version, .. } => assert_eq!(version, PROTOCOL_VERSION),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_event_args_default_to_empty() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "event", "namespace": "", "event": "ping"}))
                .unwrap();
        assert_eq!(frame, Frame::event("", "ping", vec![]));
    }

    #[test]
    fn test_with_id_only_touches_ackable_frames() {
        let message = Frame::message("chat", "hi").with_id(9);
        assert_eq!(message.ack_id(), Some(9));
        assert_eq!(
            Frame::event("", "ping", vec![]).with_id(2),
            Frame::event_with_ack(2, "", "ping", vec![])
        );
        assert_eq!(Frame::ping().with_id(3), Frame::ping());
        assert_eq!(Frame::json("", json!(1)).ack_id(), None);
    }

    #[test]
    fn test_message_id_is_optional_on_the_wire() {
        let frame: Frame =
            serde_json::from_value(json!({"type": "message", "namespace": "", "data": "x"}))
                .unwrap();
        assert_eq!(frame, Frame::message("", "x"));

        let encoded = serde_json::to_value(Frame::json("", json!(null))).unwrap();
        assert!(encoded.get("id").is_none());
    }
}
