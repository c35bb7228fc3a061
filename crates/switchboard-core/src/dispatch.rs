//! Event dispatch and outbound routing.
//!
//! The [`Dispatcher`] turns inbound events into handler invocations and
//! handler-initiated emits into deliveries. It also drives the namespace
//! lifecycle (`connect` / `disconnect`) on behalf of the transport.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use switchboard_protocol::{codec, Frame, ProtocolError};
use switchboard_transport::{ConnectionId, FrameSink, TransportError};
use tracing::{debug, info, trace, warn};

use crate::context::EventContext;
use crate::error::DispatchError;
use crate::handler::{events, EventHandler, HandlerResult};
use crate::registry::NamespaceRegistry;
use crate::session::Session;
use crate::socket::Socket;

/// A socket whose dispatch lock the current task holds.
#[derive(Clone)]
struct InFlight {
    socket: Arc<Socket>,
    session: Arc<Mutex<Session>>,
}

tokio::task_local! {
    /// Dispatches running up the current task's call chain, innermost last.
    static IN_FLIGHT: Vec<InFlight>;
}

/// Session copy of the dispatch already running for `socket` in this task.
fn in_flight_session(socket: &Arc<Socket>) -> Option<Arc<Mutex<Session>>> {
    IN_FLIGHT
        .try_with(|stack| {
            stack
                .iter()
                .rev()
                .find(|entry| Arc::ptr_eq(&entry.socket, socket))
                .map(|entry| Arc::clone(&entry.session))
        })
        .ok()
        .flatten()
}

/// Who receives an outgoing frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// One connection's socket in the namespace.
    Socket(ConnectionId),
    /// Every member of a room in the namespace.
    Room(String),
    /// Every active socket in the namespace.
    Namespace,
}

/// Body of a `send` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain text, delivered as a `message` frame.
    Text(String),
    /// Structured data, delivered as a `json` frame.
    Json(Value),
}

impl Payload {
    /// Build the frame carrying this payload in `namespace`.
    #[must_use]
    pub fn into_frame(self, namespace: impl Into<String>) -> Frame {
        match self {
            Payload::Text(text) => Frame::message(namespace, text),
            Payload::Json(data) => Frame::json(namespace, data),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Payload::Json(data)
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// The handler ran and returned this value.
    Handled(Value),
    /// No handler is registered for the event.
    Ignored,
}

/// A recipient that could not be reached during a delivery.
#[derive(Debug)]
pub struct DeliveryFailure {
    /// Connection that missed the frame.
    pub sid: ConnectionId,
    /// Why it was missed.
    pub error: TransportError,
}

/// Outcome of a delivery to one or more recipients.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    /// Recipients the frame was handed to.
    pub delivered: usize,
    /// Recipients that failed.
    pub failed: Vec<DeliveryFailure>,
}

impl DeliveryReport {
    /// Check if every recipient got the frame.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of recipients attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// Routes events between connections and handlers.
///
/// Cheap to clone; every clone shares the same registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<NamespaceRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over an existing registry.
    #[must_use]
    pub fn new(registry: Arc<NamespaceRegistry>) -> Self {
        Self { registry }
    }

    /// Start building a dispatcher and its handler table.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// The registry backing this dispatcher.
    #[must_use]
    pub fn registry(&self) -> &Arc<NamespaceRegistry> {
        &self.registry
    }

    /// Activate `namespace` for connection `sid`.
    ///
    /// Creates the socket, makes it visible to broadcasts and fires the
    /// `connect` event. Activating an already active namespace returns the
    /// existing socket without firing `connect` again.
    ///
    /// # Errors
    ///
    /// Fails with [`DispatchError::UnknownNamespace`] for namespaces nobody
    /// registered, or with the `connect` handler's failure, in which case
    /// the socket is torn down again.
    pub async fn connect(
        &self,
        sid: ConnectionId,
        namespace: &str,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Arc<Socket>, DispatchError> {
        if !self.registry.has_namespace(namespace) {
            return Err(DispatchError::UnknownNamespace(namespace.to_string()));
        }

        if let Some(existing) = self.registry.socket(&sid, namespace) {
            debug!(connection = %sid, namespace = %namespace, "Namespace already active");
            return Ok(existing);
        }

        let socket = Arc::new(Socket::new(sid, namespace, sink));
        self.registry.attach(Arc::clone(&socket));
        info!(connection = %socket.sid(), namespace = %namespace, "Namespace connected");

        if let Err(e) = self.run(&socket, events::CONNECT, Vec::new()).await {
            warn!(connection = %socket.sid(), namespace = %namespace, error = %e, "Connect handler failed");
            socket.mark_disconnected();
            self.teardown(&socket);
            return Err(e);
        }

        Ok(socket)
    }

    /// Run the disconnect lifecycle for `socket`.
    ///
    /// Fires `disconnect` before teardown, then leaves every room and
    /// detaches the socket. A failing `disconnect` handler is logged and
    /// does not stop the teardown. Returns `false` if the socket was
    /// already disconnected.
    pub async fn disconnect(&self, socket: &Arc<Socket>) -> bool {
        if !socket.mark_disconnected() {
            return false;
        }

        if let Err(e) = self.run(socket, events::DISCONNECT, Vec::new()).await {
            warn!(connection = %socket.sid(), namespace = %socket.namespace(), error = %e, "Disconnect handler failed");
        }

        self.teardown(socket);
        info!(connection = %socket.sid(), namespace = %socket.namespace(), "Namespace disconnected");
        true
    }

    /// Disconnect `namespace` of connection `sid`, if it is active.
    pub async fn disconnect_namespace(&self, sid: &ConnectionId, namespace: &str) -> bool {
        match self.registry.socket(sid, namespace) {
            Some(socket) => self.disconnect(&socket).await,
            None => false,
        }
    }

    /// Run the disconnect lifecycle for every namespace of connection `sid`.
    ///
    /// Returns the number of sockets torn down.
    pub async fn disconnect_all(&self, sid: &ConnectionId) -> usize {
        let mut count = 0;
        for socket in self.registry.sockets_of(sid) {
            if self.disconnect(&socket).await {
                count += 1;
            }
        }
        debug!(connection = %sid, sockets = count, "Connection torn down");
        count
    }

    fn teardown(&self, socket: &Socket) {
        self.registry.leave_all(socket);
        self.registry.detach(socket);
        socket.cancel_acks();
    }

    /// Dispatch `event` from `socket` to its handler.
    ///
    /// Unknown events are ignored. The handler sees a copy of the socket's
    /// session; the copy is written back whether or not the handler
    /// succeeds, so writes made before a failure are kept.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Disconnected`] if the socket is gone.
    /// - [`DispatchError::AccessDenied`] if the namespace guard rejects the
    ///   event. An `error` frame has already been sent to the client.
    /// - [`DispatchError::Handler`] if the handler fails.
    pub async fn dispatch(
        &self,
        socket: &Arc<Socket>,
        event: &str,
        args: Vec<Value>,
    ) -> Result<Dispatched, DispatchError> {
        if !socket.is_connected() {
            return Err(DispatchError::Disconnected {
                sid: socket.sid().clone(),
                namespace: socket.namespace().to_string(),
            });
        }

        if !self.registry.is_allowed(socket, event) {
            let err = DispatchError::AccessDenied {
                namespace: socket.namespace().to_string(),
                event: event.to_string(),
            };
            let frame = Frame::error(
                socket.namespace(),
                err.name(),
                format!("You do not have access to method \"{}\"", event),
                None,
            );
            if let Err(e) = socket.send(&frame) {
                debug!(connection = %socket.sid(), error = %e, "Could not report denied event");
            }
            return Err(err);
        }

        self.run(socket, event, args).await
    }

    /// Invoke the handler with session bridging, skipping the checks that
    /// only apply to client-originated events.
    ///
    /// A handler that calls back into the dispatcher for its own socket
    /// (an event, or the disconnect lifecycle) already holds the dispatch
    /// lock. The nested call runs on the same session copy without locking.
    async fn run(
        &self,
        socket: &Arc<Socket>,
        event: &str,
        args: Vec<Value>,
    ) -> Result<Dispatched, DispatchError> {
        let Some(handler) = self.registry.resolve_handler(socket.namespace(), event) else {
            trace!(namespace = %socket.namespace(), event = %event, "No handler, ignoring event");
            return Ok(Dispatched::Ignored);
        };

        if let Some(session) = in_flight_session(socket) {
            trace!(connection = %socket.sid(), namespace = %socket.namespace(), event = %event, "Dispatching nested");
            let cx = EventContext::sharing(self.clone(), Arc::clone(socket), session);
            return handled(event, handler.call(cx, args).await);
        }

        // One dispatch at a time per socket: the session copy below is a
        // read-modify-write of the socket's store.
        let _in_flight = socket.lock_dispatch().await;

        let cx = EventContext::new(self.clone(), Arc::clone(socket), socket.session());
        let mut stack = IN_FLIGHT.try_with(Clone::clone).unwrap_or_default();
        stack.push(InFlight {
            socket: Arc::clone(socket),
            session: cx.shared_session(),
        });

        trace!(connection = %socket.sid(), namespace = %socket.namespace(), event = %event, "Dispatching");
        let result = IN_FLIGHT.scope(stack, handler.call(cx.clone(), args)).await;
        socket.store_session(cx.session_snapshot());

        handled(event, result)
    }

    /// Emit `event` with `args` in `namespace` to `target`.
    ///
    /// # Errors
    ///
    /// Fails only if the frame cannot be encoded; per-recipient failures are
    /// reported in the returned [`DeliveryReport`].
    pub fn emit(
        &self,
        namespace: &str,
        event: &str,
        args: Vec<Value>,
        target: Target,
    ) -> Result<DeliveryReport, DispatchError> {
        let frame = Frame::event(namespace, event, args);
        Ok(self.deliver(namespace, &frame, target)?)
    }

    /// Send a `message` or `json` payload in `namespace` to `target`.
    ///
    /// # Errors
    ///
    /// Fails only if the frame cannot be encoded.
    pub fn send(
        &self,
        namespace: &str,
        payload: Payload,
        target: Target,
    ) -> Result<DeliveryReport, DispatchError> {
        let frame = payload.into_frame(namespace);
        Ok(self.deliver(namespace, &frame, target)?)
    }

    /// Encode `frame` once and hand it to every recipient of `target`.
    pub(crate) fn deliver(
        &self,
        namespace: &str,
        frame: &Frame,
        target: Target,
    ) -> Result<DeliveryReport, ProtocolError> {
        let data = codec::encode(frame)?;
        let recipients = self.recipients(namespace, &target);
        let report = deliver_to(&recipients, &data);

        debug!(
            namespace = %namespace,
            target = ?target,
            frame = %frame.frame_type(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "Delivered"
        );
        Ok(report)
    }

    fn recipients(&self, namespace: &str, target: &Target) -> Vec<Arc<Socket>> {
        match target {
            Target::Socket(sid) => self.registry.socket(sid, namespace).into_iter().collect(),
            Target::Room(room) => self.registry.members_of(namespace, room),
            Target::Namespace => self.registry.all_active_connections(namespace),
        }
    }
}

fn handled(event: &str, result: HandlerResult) -> Result<Dispatched, DispatchError> {
    result
        .map(Dispatched::Handled)
        .map_err(|source| DispatchError::Handler {
            event: event.to_string(),
            source,
        })
}

/// Send `data` to each recipient independently.
fn deliver_to(recipients: &[Arc<Socket>], data: &Bytes) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for socket in recipients {
        match socket.send_raw(data.clone()) {
            Ok(()) => report.delivered += 1,
            Err(error) => {
                warn!(connection = %socket.sid(), namespace = %socket.namespace(), error = %error, "Delivery failed");
                report.failed.push(DeliveryFailure {
                    sid: socket.sid().clone(),
                    error,
                });
            }
        }
    }
    report
}

/// Builds the handler table before the server starts.
#[derive(Default)]
pub struct DispatcherBuilder {
    registry: NamespaceRegistry,
}

impl DispatcherBuilder {
    /// Register `handler` for `event` in `namespace`.
    #[must_use]
    pub fn on<H: EventHandler>(self, namespace: &str, event: &str, handler: H) -> Self {
        self.registry.register_handler(namespace, event, handler);
        self
    }

    /// Install an authorization hook for `namespace`.
    #[must_use]
    pub fn guard<G>(self, namespace: &str, guard: G) -> Self
    where
        G: Fn(&Socket, &str) -> bool + Send + Sync + 'static,
    {
        self.registry.set_guard(namespace, guard);
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Dispatcher {
        Dispatcher::new(Arc::new(self.registry))
    }
}
