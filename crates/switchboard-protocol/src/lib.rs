//! # switchboard-protocol
//!
//! Wire protocol definitions for the Switchboard event router.
//!
//! This crate defines the frames exchanged between clients and the server
//! and the length-prefixed MessagePack codec that carries them.
//!
//! ## Frame Types
//!
//! - `Connect` / `Disconnect` - Namespace activation
//! - `Event` / `Message` / `Json` - Application traffic
//! - `Ack` / `Error` - Replies to events
//! - `Connected` / `Ping` / `Pong` - Handshake and keepalive
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use switchboard_protocol::{codec, Frame};
//!
//! let frame = Frame::event("chat", "greet", vec![json!("hi")]);
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, DEFAULT_NAMESPACE, PROTOCOL_VERSION};
