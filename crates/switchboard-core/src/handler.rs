//! Event handlers and namespace guards.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::context::EventContext;
use crate::error::HandlerError;
use crate::socket::Socket;

/// Virtual events fired by the connection lifecycle.
pub mod events {
    /// Fired once after a namespace is activated, before any other event.
    pub const CONNECT: &str = "connect";
    /// Fired once before a namespace socket is torn down.
    pub const DISCONNECT: &str = "disconnect";
    /// Fired for plain text payloads.
    pub const MESSAGE: &str = "message";
    /// Fired for structured payloads.
    pub const JSON: &str = "json";
}

/// Value returned by a handler. `Value::Null` means "nothing to reply".
pub type HandlerResult = Result<Value, HandlerError>;

/// Handles one event name in one namespace.
///
/// Any `Fn(EventContext, Vec<Value>) -> impl Future<Output = HandlerResult>`
/// is a handler, so most applications register plain async closures.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle the event.
    async fn call(&self, cx: EventContext, args: Vec<Value>) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(EventContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, cx: EventContext, args: Vec<Value>) -> HandlerResult {
        (self)(cx, args).await
    }
}

/// Shared handler reference stored in the registry.
pub type BoxedHandler = Arc<dyn EventHandler>;

/// Namespace-level authorization hook.
///
/// Called with the originating socket and the event name before every
/// dispatch; returning `false` rejects the event.
pub type Guard = Arc<dyn Fn(&Socket, &str) -> bool + Send + Sync>;

/// Deserialize the positional argument at `index`.
///
/// A missing argument is read as `null`, so `Option<T>` accepts it.
///
/// # Errors
///
/// Returns [`HandlerError::InvalidArgument`] if the value does not fit `T`.
pub fn arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, HandlerError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| HandlerError::InvalidArgument {
        index,
        reason: e.to_string(),
    })
}
