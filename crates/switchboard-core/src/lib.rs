//! # switchboard-core
//!
//! Namespaces, rooms and event dispatch for the Switchboard event router.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Socket** - One connection's state inside one namespace
//! - **Registry** - Handler table, guards and room membership
//! - **Dispatcher** - Routes inbound events to handlers and outbound frames to recipients
//! - **EventContext** - What a handler sees of the event it is handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│ Dispatcher  │────▶│   Handler   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   │
//!        │            ┌─────────────┐            │
//!        └────────────│  Registry   │◀───────────┘
//!          frames     └─────────────┘   join / leave / emit
//! ```
//!
//! ## Example
//!
//! ```rust
//! use serde_json::Value;
//! use switchboard_core::{Dispatcher, EmitOptions, EventContext, HandlerResult};
//!
//! async fn join(cx: EventContext, args: Vec<Value>) -> HandlerResult {
//!     let room: String = switchboard_core::arg(&args, 0)?;
//!     cx.join_room(&room);
//!     cx.emit_with("joined", vec![cx.sid().as_str().into()], EmitOptions::room(room))?;
//!     Ok(Value::Null)
//! }
//!
//! let dispatcher = Dispatcher::builder().on("chat", "join", join).build();
//! assert!(dispatcher.registry().has_namespace("chat"));
//! ```

pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod registry;
pub mod session;
pub mod socket;

pub use context::{EmitOptions, EventContext};
pub use dispatch::{
    DeliveryFailure, DeliveryReport, Dispatched, Dispatcher, DispatcherBuilder, Payload, Target,
};
pub use error::{DispatchError, HandlerError};
pub use handler::{arg, events, BoxedHandler, EventHandler, Guard, HandlerResult};
pub use registry::{NamespaceRegistry, RegistryStats};
pub use session::Session;
pub use socket::{PendingAck, Socket};
