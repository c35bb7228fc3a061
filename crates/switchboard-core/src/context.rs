//! The handle passed to every event handler.

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use switchboard_protocol::Frame;
use switchboard_transport::ConnectionId;
use tracing::warn;

use crate::dispatch::{DeliveryReport, Dispatcher, Payload, Target};
use crate::error::HandlerError;
use crate::session::Session;
use crate::socket::{PendingAck, Socket};

/// Where an emit from a handler goes.
///
/// The default addresses the calling socket in its own namespace.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    /// Namespace to emit in. Defaults to the caller's namespace.
    pub namespace: Option<String>,
    /// Deliver to every member of this room.
    pub room: Option<String>,
    /// Deliver to every active socket of the namespace.
    pub broadcast: bool,
}

impl EmitOptions {
    /// Address every member of `room`.
    #[must_use]
    pub fn room(room: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            ..Self::default()
        }
    }

    /// Address the whole namespace.
    #[must_use]
    pub fn broadcast() -> Self {
        Self {
            broadcast: true,
            ..Self::default()
        }
    }

    /// Emit in `namespace` instead of the caller's.
    #[must_use]
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Everything a handler knows about the event it is handling.
///
/// Carries the originating socket, a working copy of its session and a
/// dispatcher for routing further frames. Cloning is cheap; clones share
/// the same session copy.
#[derive(Clone)]
pub struct EventContext {
    dispatcher: Dispatcher,
    socket: Arc<Socket>,
    session: Arc<Mutex<Session>>,
}

impl EventContext {
    pub(crate) fn new(dispatcher: Dispatcher, socket: Arc<Socket>, session: Session) -> Self {
        Self::sharing(dispatcher, socket, Arc::new(Mutex::new(session)))
    }

    /// Context working on an existing session copy.
    pub(crate) fn sharing(
        dispatcher: Dispatcher,
        socket: Arc<Socket>,
        session: Arc<Mutex<Session>>,
    ) -> Self {
        Self {
            dispatcher,
            socket,
            session,
        }
    }

    /// Connection the event came from.
    #[must_use]
    pub fn sid(&self) -> &ConnectionId {
        self.socket.sid()
    }

    /// Namespace the event was dispatched in.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.socket.namespace()
    }

    /// The originating socket.
    #[must_use]
    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// The dispatcher that invoked the handler.
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Working copy of the socket's session.
    ///
    /// Changes are written back to the socket when the handler returns.
    /// Do not hold the guard across an `.await`.
    pub fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    pub(crate) fn session_snapshot(&self) -> Session {
        self.session.lock().clone()
    }

    pub(crate) fn shared_session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    /// Emit `event` to the calling socket.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or the connection is gone.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), HandlerError> {
        let frame = Frame::event(self.namespace(), event, args);
        self.socket.send(&frame)?;
        Ok(())
    }

    /// Emit `event` to the recipients selected by `options`.
    ///
    /// Failures of individual recipients are reported, not raised.
    ///
    /// # Errors
    ///
    /// Fails only if the frame cannot be encoded.
    pub fn emit_with(
        &self,
        event: &str,
        args: Vec<Value>,
        options: EmitOptions,
    ) -> Result<DeliveryReport, HandlerError> {
        let (namespace, target) = self.resolve(options);
        let frame = Frame::event(namespace.as_str(), event, args);
        Ok(self.dispatcher.deliver(&namespace, &frame, target)?)
    }

    /// Send a `message` or `json` payload to the calling socket.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or the connection is gone.
    pub fn send(&self, payload: impl Into<Payload>) -> Result<(), HandlerError> {
        let frame = payload.into().into_frame(self.namespace());
        self.socket.send(&frame)?;
        Ok(())
    }

    /// Send a payload to the recipients selected by `options`.
    ///
    /// # Errors
    ///
    /// Fails only if the frame cannot be encoded.
    pub fn send_with(
        &self,
        payload: impl Into<Payload>,
        options: EmitOptions,
    ) -> Result<DeliveryReport, HandlerError> {
        let (namespace, target) = self.resolve(options);
        let frame = payload.into().into_frame(namespace.as_str());
        Ok(self.dispatcher.deliver(&namespace, &frame, target)?)
    }

    /// Emit `event` to the calling socket and ask the client to
    /// acknowledge it.
    ///
    /// Await [`PendingAck::recv`] outside of any session guard; the answer
    /// arrives as an inbound `ack` frame.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or the connection is gone.
    pub fn emit_with_ack(&self, event: &str, args: Vec<Value>) -> Result<PendingAck, HandlerError> {
        let frame = Frame::event(self.namespace(), event, args);
        Ok(self.socket.send_with_ack(frame)?)
    }

    /// Send a payload to the calling socket and ask the client to
    /// acknowledge it.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or the connection is gone.
    pub fn send_with_ack(&self, payload: impl Into<Payload>) -> Result<PendingAck, HandlerError> {
        let frame = payload.into().into_frame(self.namespace());
        Ok(self.socket.send_with_ack(frame)?)
    }

    fn resolve(&self, options: EmitOptions) -> (String, Target) {
        let namespace = options
            .namespace
            .unwrap_or_else(|| self.namespace().to_string());
        let target = match options.room {
            Some(room) => Target::Room(room),
            None if options.broadcast => Target::Namespace,
            None => Target::Socket(self.sid().clone()),
        };
        (namespace, target)
    }

    /// Put the calling socket into `room`.
    ///
    /// Returns `false` if it was already a member or is disconnecting.
    pub fn join_room(&self, room: &str) -> bool {
        self.dispatcher.registry().join(&self.socket, room)
    }

    /// Take the calling socket out of `room`.
    ///
    /// Returns `false` if it was not a member.
    pub fn leave_room(&self, room: &str) -> bool {
        self.dispatcher.registry().leave(&self.socket, room)
    }

    /// Rooms the calling socket is in.
    #[must_use]
    pub fn rooms(&self) -> HashSet<String> {
        self.socket.rooms()
    }

    /// Report an error to the calling socket.
    ///
    /// The `error` frame is always sent; `quiet` only keeps it out of the
    /// server log.
    ///
    /// # Errors
    ///
    /// Fails if the frame cannot be encoded or the connection is gone.
    pub fn error(
        &self,
        name: &str,
        message: &str,
        id: Option<u64>,
        quiet: bool,
    ) -> Result<(), HandlerError> {
        if !quiet {
            warn!(connection = %self.sid(), namespace = %self.namespace(), name = %name, message = %message, "Error reported to client");
        }
        let frame = Frame::error(self.namespace(), name, message, id);
        self.socket.send(&frame)?;
        Ok(())
    }

    /// Ask the transport to close the physical connection.
    ///
    /// The client is sent a `disconnect` frame unless `silent` is set. The
    /// disconnect lifecycle runs once the transport has shut down.
    ///
    /// # Errors
    ///
    /// Fails if the connection is already gone.
    pub fn disconnect(&self, silent: bool) -> Result<(), HandlerError> {
        self.socket.close(silent)?;
        Ok(())
    }
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}
