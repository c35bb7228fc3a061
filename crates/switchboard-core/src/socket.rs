//! Per-namespace connection state.
//!
//! A [`Socket`] exists for every namespace a physical connection has
//! activated. It owns the room mirror, the session store and the handle used
//! to address frames back to the client.

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use switchboard_protocol::Frame;
use switchboard_transport::{ConnectionId, FrameSink, TransportError};
use tokio::sync::{oneshot, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tracing::{debug, trace};

use crate::session::Session;

/// One connection's membership of one namespace.
pub struct Socket {
    sid: ConnectionId,
    namespace: String,
    /// Mirror of the registry's room table. Only mutated by the registry
    /// while it holds the namespace lock.
    rooms: Mutex<HashSet<String>>,
    session: Mutex<Session>,
    sink: Arc<dyn FrameSink>,
    connected: AtomicBool,
    /// Held for the whole duration of a dispatch.
    dispatch_lock: AsyncMutex<()>,
    /// Server-initiated frames waiting for the client's ack.
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>,
    next_ack_id: AtomicU64,
}

/// Acknowledgment the client owes for a frame sent with
/// [`Socket::send_with_ack`].
#[derive(Debug)]
pub struct PendingAck {
    id: u64,
    rx: oneshot::Receiver<Vec<Value>>,
}

impl PendingAck {
    /// ID the frame was sent under.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the client's answer.
    ///
    /// Returns `None` if the socket disconnected before the ack arrived.
    pub async fn recv(self) -> Option<Vec<Value>> {
        self.rx.await.ok()
    }
}

impl Socket {
    /// Create a socket for `sid` in `namespace`.
    #[must_use]
    pub fn new(sid: ConnectionId, namespace: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sid,
            namespace: namespace.into(),
            rooms: Mutex::new(HashSet::new()),
            session: Mutex::new(Session::new()),
            sink,
            connected: AtomicBool::new(true),
            dispatch_lock: AsyncMutex::new(()),
            pending_acks: Mutex::new(HashMap::new()),
            next_ack_id: AtomicU64::new(1),
        }
    }

    /// The physical connection this socket belongs to.
    #[must_use]
    pub fn sid(&self) -> &ConnectionId {
        &self.sid
    }

    /// The namespace this socket belongs to.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Snapshot of the joined rooms.
    #[must_use]
    pub fn rooms(&self) -> HashSet<String> {
        self.rooms.lock().clone()
    }

    /// Check if the socket is in `room`.
    #[must_use]
    pub fn in_room(&self, room: &str) -> bool {
        self.rooms.lock().contains(room)
    }

    /// Snapshot of the session store.
    #[must_use]
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    /// Check if the socket has not been disconnected yet.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Encode and send a frame to this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone.
    pub fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        trace!(connection = %self.sid, namespace = %self.namespace, frame = %frame.frame_type(), "Sending frame");
        self.sink.send(frame)
    }

    /// Send pre-encoded frame bytes to this connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    pub fn send_raw(&self, data: Bytes) -> Result<(), TransportError> {
        self.sink.send_raw(data)
    }

    /// Ask the transport to tear down the physical connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already gone.
    pub fn close(&self, silent: bool) -> Result<(), TransportError> {
        self.sink.close(&self.namespace, silent)
    }

    /// Send `frame` and ask the client to acknowledge it.
    ///
    /// The frame is tagged with a fresh ID. Frames that cannot carry an ID
    /// (anything but `event`, `message` and `json`) are still sent, but
    /// their ack never arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone; no ack
    /// is left pending in that case.
    pub fn send_with_ack(&self, frame: Frame) -> Result<PendingAck, TransportError> {
        let id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().insert(id, tx);

        if let Err(e) = self.send(&frame.with_id(id)) {
            self.pending_acks.lock().remove(&id);
            return Err(e);
        }
        Ok(PendingAck { id, rx })
    }

    /// Resolve the pending ack `id` with the client's `args`.
    ///
    /// Returns `false` for IDs that are unknown or already answered.
    pub fn acknowledge(&self, id: u64, args: Vec<Value>) -> bool {
        let Some(tx) = self.pending_acks.lock().remove(&id) else {
            return false;
        };
        // The waiter may have given up; the ack is consumed either way.
        let _ = tx.send(args);
        true
    }

    /// Number of acks still owed by the client.
    #[must_use]
    pub fn pending_acks(&self) -> usize {
        self.pending_acks.lock().len()
    }

    /// Drop every pending ack; waiters see `None`.
    pub(crate) fn cancel_acks(&self) {
        let cancelled = std::mem::take(&mut *self.pending_acks.lock());
        if !cancelled.is_empty() {
            debug!(connection = %self.sid, namespace = %self.namespace, acks = cancelled.len(), "Cancelled pending acks");
        }
    }

    pub(crate) fn add_room(&self, room: &str) -> bool {
        self.rooms.lock().insert(room.to_string())
    }

    pub(crate) fn remove_room(&self, room: &str) -> bool {
        self.rooms.lock().remove(room)
    }

    pub(crate) fn store_session(&self, session: Session) {
        *self.session.lock() = session;
    }

    /// Flip to disconnected. Returns `true` for the first caller only.
    pub(crate) fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    pub(crate) async fn lock_dispatch(&self) -> AsyncMutexGuard<'_, ()> {
        self.dispatch_lock.lock().await
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("sid", &self.sid)
            .field("namespace", &self.namespace)
            .field("rooms", &*self.rooms.lock())
            .field("connected", &self.is_connected())
            .field("pending_acks", &self.pending_acks())
            .finish_non_exhaustive()
    }
}
