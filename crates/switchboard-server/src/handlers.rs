//! Connection handlers for the Switchboard server.
//!
//! This module owns the physical connection lifecycle: it upgrades the
//! WebSocket, decodes inbound frames, drives the dispatcher and makes sure
//! every namespace socket is torn down when the transport goes away.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_core::{events, DispatchError, Dispatched, Dispatcher};
use switchboard_protocol::{codec, Frame, ProtocolError, DEFAULT_NAMESPACE};
use switchboard_transport::{outbound_channel, websocket, ConnectionId, FrameSink};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Routes events to the application handlers.
    pub dispatcher: Dispatcher,
    /// Server configuration.
    pub config: Config,
    /// Connections currently upgraded.
    active: AtomicUsize,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config, dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            config,
            active: AtomicUsize::new(0),
        }
    }

    /// Reserve a connection slot, or `None` when the server is full.
    fn admit(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let max = self.config.limits.max_connections;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionSlot(Arc::clone(self)))
    }
}

/// Releases a connection slot on drop.
struct ConnectionSlot(Arc<AppState>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, dispatcher: Dispatcher) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let path = config.transport.websocket_path.clone();
    let app = router(Arc::new(AppState::new(config, dispatcher)));

    let listener = TcpListener::bind(addr).await?;

    info!("Switchboard server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.dispatcher.registry().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = state.admit() else {
        warn!(
            max = state.config.limits.max_connections,
            "Connection limit reached, refusing upgrade"
        );
        metrics::record_rejection();
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, "WebSocket connected");

    // The read half stays here; the write half drains the outbound queue.
    let (ws_sender, mut ws_receiver) = socket.split();
    let (outbound, outbound_rx) = outbound_channel();
    let sink: Arc<dyn FrameSink> = Arc::new(outbound);

    let mut writer = tokio::spawn(websocket::write_loop(
        ws_sender,
        outbound_rx,
        connection_id.clone(),
        |bytes| metrics::record_frame(bytes, "outbound"),
    ));

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    if let Err(e) = sink.send(&Frame::connected(connection_id.as_str(), heartbeat)) {
        error!(connection = %connection_id, error = %e, "Failed to send Connected frame");
        writer.abort();
        return;
    }

    activate_namespace(&state, &connection_id, &sink, DEFAULT_NAMESPACE).await;

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let max_buffered = state.config.limits.max_message_size;
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut writer_done = false;

    // Message processing loop
    loop {
        tokio::select! {
            // The writer stops on a close request or a dead socket.
            result = &mut writer => {
                writer_done = true;
                match result {
                    Ok(Ok(())) => debug!(connection = %connection_id, "Writer finished"),
                    Ok(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "Writer failed");
                        metrics::record_error("transport");
                    }
                    Err(e) => error!(connection = %connection_id, error = %e, "Writer task panicked"),
                }
                break;
            }

            msg = tokio::time::timeout(idle_timeout, ws_receiver.next()) => {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(_) => {
                        info!(connection = %connection_id, "Heartbeat timeout");
                        break;
                    }
                };

                match msg {
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Ok(message)) => {
                        let Some(data) = websocket::inbound_bytes(&message) else {
                            // Ping/Pong are answered by axum
                            continue;
                        };

                        if read_buffer.len() + data.len() > max_buffered {
                            warn!(connection = %connection_id, "Inbound buffer limit exceeded");
                            metrics::record_error("message_too_large");
                            break;
                        }
                        read_buffer.extend_from_slice(data);

                        loop {
                            match next_frame(&mut read_buffer) {
                                Ok(Some((frame, size))) => {
                                    metrics::record_frame(size, "inbound");
                                    handle_frame(frame, &connection_id, &state, &sink).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Undecodable frame, dropping buffer");
                                    metrics::record_error("decode");
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Cleanup: run the disconnect lifecycle for every active namespace
    let torn_down = state.dispatcher.disconnect_all(&connection_id).await;
    metrics::set_active_rooms(state.dispatcher.registry().stats().room_count);

    if !writer_done {
        // Flush what the disconnect handlers queued, then stop the writer.
        if sink.close(DEFAULT_NAMESPACE, true).is_err() {
            writer.abort();
        } else if let Err(e) = writer.await {
            debug!(connection = %connection_id, error = %e, "Writer did not finish cleanly");
        }
    }

    debug!(connection = %connection_id, namespaces = torn_down, "WebSocket disconnected");
}

/// Decode the next complete frame from `buffer`, with its encoded size.
fn next_frame(buffer: &mut BytesMut) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let before = buffer.len();
    let frame = codec::decode_from(buffer)?;
    Ok(frame.map(|frame| (frame, before - buffer.len())))
}

/// Activate `namespace` for the connection, reporting failures to the client.
async fn activate_namespace(
    state: &AppState,
    connection_id: &ConnectionId,
    sink: &Arc<dyn FrameSink>,
    namespace: &str,
) {
    match state
        .dispatcher
        .connect(connection_id.clone(), namespace, Arc::clone(sink))
        .await
    {
        Ok(_) => {
            reply(sink, connection_id, &Frame::connect(namespace));
        }
        Err(e) => {
            warn!(connection = %connection_id, namespace = %namespace, error = %e, "Namespace activation failed");
            metrics::record_error(e.name());
            reply(
                sink,
                connection_id,
                &Frame::error(namespace, e.name(), e.to_string(), None),
            );
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    connection_id: &ConnectionId,
    state: &AppState,
    sink: &Arc<dyn FrameSink>,
) {
    match frame {
        Frame::Connect { namespace } => {
            debug!(connection = %connection_id, namespace = %namespace, "Connect request");
            activate_namespace(state, connection_id, sink, &namespace).await;
        }

        Frame::Disconnect { namespace } => {
            debug!(connection = %connection_id, namespace = %namespace, "Disconnect request");
            state
                .dispatcher
                .disconnect_namespace(connection_id, &namespace)
                .await;
        }

        Frame::Event {
            namespace,
            event,
            args,
            id,
        } => {
            if event == events::CONNECT || event == events::DISCONNECT {
                warn!(connection = %connection_id, event = %event, "Client sent a reserved event");
                return;
            }
            dispatch_event(state, connection_id, sink, &namespace, &event, args, id).await;
        }

        Frame::Message { namespace, data, id } => {
            let args = vec![Value::String(data)];
            dispatch_event(state, connection_id, sink, &namespace, events::MESSAGE, args, id)
                .await;
        }

        Frame::Json { namespace, data, id } => {
            dispatch_event(state, connection_id, sink, &namespace, events::JSON, vec![data], id)
                .await;
        }

        Frame::Ack { namespace, id, args } => {
            let acknowledged = state
                .dispatcher
                .registry()
                .socket(connection_id, &namespace)
                .is_some_and(|socket| socket.acknowledge(id, args));
            if !acknowledged {
                debug!(connection = %connection_id, namespace = %namespace, id, "Ack for nothing pending, ignoring");
            }
        }

        Frame::Ping { timestamp } => {
            reply(sink, connection_id, &Frame::pong(timestamp));
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(connection = %connection_id, frame_type = %other.frame_type(), "Unexpected frame type");
        }
    }
}

/// Dispatch one event and answer its ack id, if any.
async fn dispatch_event(
    state: &AppState,
    connection_id: &ConnectionId,
    sink: &Arc<dyn FrameSink>,
    namespace: &str,
    event: &str,
    args: Vec<Value>,
    id: Option<u64>,
) {
    let Some(socket) = state.dispatcher.registry().socket(connection_id, namespace) else {
        debug!(connection = %connection_id, namespace = %namespace, event = %event, "Event for inactive namespace, ignoring");
        return;
    };

    let start = Instant::now();
    let result = state.dispatcher.dispatch(&socket, event, args).await;
    metrics::record_dispatch(start.elapsed().as_secs_f64(), namespace);
    metrics::set_active_rooms(state.dispatcher.registry().stats().room_count);

    match result {
        Ok(Dispatched::Handled(value)) => {
            if let Some(id) = id {
                let args = if value.is_null() { Vec::new() } else { vec![value] };
                reply(sink, connection_id, &Frame::ack(namespace, id, args));
            }
        }
        Ok(Dispatched::Ignored) => {
            debug!(connection = %connection_id, namespace = %namespace, event = %event, "No handler");
        }
        Err(e @ DispatchError::AccessDenied { .. }) => {
            // The dispatcher already told the client.
            debug!(connection = %connection_id, error = %e, "Event rejected");
            metrics::record_error(e.name());
        }
        Err(e) => {
            warn!(connection = %connection_id, namespace = %namespace, event = %event, error = %e, "Event failed");
            metrics::record_error(e.name());
            if let Some(id) = id {
                reply(
                    sink,
                    connection_id,
                    &Frame::error(namespace, e.name(), e.to_string(), Some(id)),
                );
            }
        }
    }
}

/// Send a reply to the connection, logging failures.
fn reply(sink: &Arc<dyn FrameSink>, connection_id: &ConnectionId, frame: &Frame) {
    if let Err(e) = sink.send(frame) {
        debug!(connection = %connection_id, frame_type = %frame.frame_type(), error = %e, "Reply not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat;
    use serde_json::json;
    use switchboard_transport::{Outbound, OutboundReceiver};

    fn state() -> AppState {
        AppState::new(Config::default(), chat::dispatcher())
    }

    fn connection() -> (ConnectionId, Arc<dyn FrameSink>, OutboundReceiver) {
        let (tx, rx) = outbound_channel();
        (ConnectionId::generate(), Arc::new(tx), rx)
    }

    fn frames(rx: &mut OutboundReceiver) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Some(item) = rx.try_recv() {
            if let Outbound::Frame(data) = item {
                out.push(codec::decode(&data).unwrap());
            }
        }
        out
    }

    #[tokio::test]
    async fn test_connect_frame_activates_namespace() {
        let state = state();
        let (sid, sink, mut rx) = connection();

        handle_frame(Frame::connect(chat::CHAT), &sid, &state, &sink).await;

        assert!(state.dispatcher.registry().socket(&sid, chat::CHAT).is_some());
        assert_eq!(
            frames(&mut rx),
            vec![
                Frame::event(chat::CHAT, "welcome", vec![json!(sid.as_str())]),
                Frame::connect(chat::CHAT),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_namespace_answers_error() {
        let state = state();
        let (sid, sink, mut rx) = connection();

        handle_frame(Frame::connect("/nowhere"), &sid, &state, &sink).await;

        match frames(&mut rx).as_slice() {
            [Frame::Error { namespace, name, .. }] => {
                assert_eq!(namespace, "/nowhere");
                assert_eq!(name, "invalid_namespace");
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_event_with_id_is_acked() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, DEFAULT_NAMESPACE).await;
        frames(&mut rx);

        let frame = Frame::event_with_ack(7, DEFAULT_NAMESPACE, "ping", vec![json!(1)]);
        handle_frame(frame, &sid, &state, &sink).await;

        assert_eq!(
            frames(&mut rx),
            vec![Frame::ack(DEFAULT_NAMESPACE, 7, vec![json!({"pong": [1]})])]
        );
    }

    #[tokio::test]
    async fn test_failed_event_with_id_gets_error() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, chat::CHAT).await;
        frames(&mut rx);

        // `nick` expects a string
        let frame = Frame::event_with_ack(3, chat::CHAT, "nick", vec![json!(42)]);
        handle_frame(frame, &sid, &state, &sink).await;

        match frames(&mut rx).as_slice() {
            [Frame::Error { name, id, .. }] => {
                assert_eq!(name, "handler_error");
                assert_eq!(*id, Some(3));
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_frame_dispatched_as_message_event() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, DEFAULT_NAMESPACE).await;
        frames(&mut rx);

        handle_frame(Frame::message(DEFAULT_NAMESPACE, "echo"), &sid, &state, &sink).await;

        assert_eq!(frames(&mut rx), vec![Frame::message(DEFAULT_NAMESPACE, "echo")]);
    }

    #[tokio::test]
    async fn test_reserved_events_rejected() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, chat::CHAT).await;
        frames(&mut rx);

        handle_frame(Frame::event(chat::CHAT, events::CONNECT, vec![]), &sid, &state, &sink).await;

        assert!(frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_frame_tears_down_namespace() {
        let state = state();
        let (sid, sink, _rx) = connection();
        activate_namespace(&state, &sid, &sink, chat::CHAT).await;
        let socket = state.dispatcher.registry().socket(&sid, chat::CHAT).unwrap();
        state.dispatcher.registry().join(&socket, "lobby");

        handle_frame(Frame::disconnect(chat::CHAT), &sid, &state, &sink).await;

        assert!(state.dispatcher.registry().socket(&sid, chat::CHAT).is_none());
        assert!(!state.dispatcher.registry().room_exists(chat::CHAT, "lobby"));
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let state = state();
        let (sid, sink, mut rx) = connection();

        handle_frame(Frame::Ping { timestamp: Some(5) }, &sid, &state, &sink).await;

        assert_eq!(frames(&mut rx), vec![Frame::pong(Some(5))]);
    }

    #[tokio::test]
    async fn test_client_ack_resolves_server_emit() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, chat::CHAT).await;
        frames(&mut rx);
        let socket = state.dispatcher.registry().socket(&sid, chat::CHAT).unwrap();

        let ack = socket
            .send_with_ack(Frame::event(chat::CHAT, "confirm", vec![]))
            .unwrap();
        let id = ack.id();
        handle_frame(Frame::ack(chat::CHAT, id, vec![json!("ok")]), &sid, &state, &sink).await;

        assert_eq!(ack.recv().await, Some(vec![json!("ok")]));
        // A repeated ack finds nothing pending.
        handle_frame(Frame::ack(chat::CHAT, id, vec![]), &sid, &state, &sink).await;
        assert_eq!(socket.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_message_with_id_is_acked() {
        let state = state();
        let (sid, sink, mut rx) = connection();
        activate_namespace(&state, &sid, &sink, DEFAULT_NAMESPACE).await;
        frames(&mut rx);

        let frame = Frame::message(DEFAULT_NAMESPACE, "echo").with_id(4);
        handle_frame(frame, &sid, &state, &sink).await;

        assert_eq!(
            frames(&mut rx),
            vec![
                Frame::message(DEFAULT_NAMESPACE, "echo"),
                Frame::ack(DEFAULT_NAMESPACE, 4, vec![]),
            ]
        );
    }

    #[test]
    fn test_next_frame_reports_each_frame_size() {
        let first = Frame::message(DEFAULT_NAMESPACE, "a");
        let second = Frame::event("/chat", "say", vec![json!("lobby"), json!("a longer line")]);
        let first_len = codec::encode(&first).unwrap().len();
        let second_len = codec::encode(&second).unwrap().len();

        let mut buffer = BytesMut::new();
        codec::encode_into(&first, &mut buffer).unwrap();
        codec::encode_into(&second, &mut buffer).unwrap();

        assert_eq!(next_frame(&mut buffer).unwrap(), Some((first, first_len)));
        assert_eq!(next_frame(&mut buffer).unwrap(), Some((second, second_len)));
        assert_eq!(next_frame(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_connection_limit() {
        let config = Config {
            limits: crate::config::LimitsConfig {
                max_connections: 1,
                ..Default::default()
            },
            ..Config::default()
        };
        let state = Arc::new(AppState::new(config, chat::dispatcher()));

        let slot = state.admit();
        assert!(slot.is_some());
        assert!(state.admit().is_none());

        drop(slot);
        assert!(state.admit().is_some());
    }
}
