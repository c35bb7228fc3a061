//! # switchboard-transport
//!
//! Transport plumbing for the Switchboard event router.
//!
//! The routing core treats the transport as an opaque collaborator that
//! delivers decoded frames and accepts encoded ones. This crate provides the
//! pieces of that collaborator the core and the server share:
//!
//! - **ConnectionId** - Identity of a physical connection
//! - **FrameSink** - Non-blocking outbound interface used by the core
//! - **Outbound queue** - The `FrameSink` implementation used by the server
//! - **WebSocket pump** - Drains an outbound queue into an axum WebSocket
//!
//! ```rust,ignore
//! use switchboard_transport::{outbound_channel, websocket, ConnectionId};
//!
//! let (sink, queue) = outbound_channel();
//! tokio::spawn(websocket::write_loop(ws_tx, queue, ConnectionId::generate(), |_| {}));
//! ```

pub mod outbound;
pub mod traits;
pub mod websocket;

pub use outbound::{outbound_channel, Outbound, OutboundReceiver, OutboundSender};
pub use traits::{ConnectionId, FrameSink, TransportError};
