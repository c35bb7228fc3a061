//! Namespace registry.
//!
//! The registry is the single source of truth for "who is where": which
//! handlers a namespace has, which sockets are in which room, and which
//! namespaces every physical connection has activated.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use switchboard_protocol::DEFAULT_NAMESPACE;
use switchboard_transport::ConnectionId;
use tracing::{debug, info};

use crate::handler::{BoxedHandler, EventHandler, Guard};
use crate::socket::Socket;

/// Handlers and guard of one namespace.
#[derive(Default)]
struct NamespaceEntry {
    handlers: HashMap<String, BoxedHandler>,
    guard: Option<Guard>,
}

/// Room name -> members, keyed by connection.
type RoomTable = HashMap<String, HashMap<ConnectionId, Arc<Socket>>>;

/// Process-wide table of namespaces, rooms and active sockets.
///
/// Room tables are sharded by namespace: every join or leave holds the
/// namespace's entry lock while it updates both the room table and the
/// socket's own mirror, so the two can never disagree.
#[derive(Default)]
pub struct NamespaceRegistry {
    /// Handlers indexed by namespace.
    namespaces: DashMap<String, NamespaceEntry>,
    /// Rooms indexed by namespace. Empty tables are pruned.
    rooms: DashMap<String, RoomTable>,
    /// Active sockets (connection -> namespace -> socket).
    connections: DashMap<ConnectionId, HashMap<String, Arc<Socket>>>,
}

impl NamespaceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `event` in `namespace`.
    pub fn register_handler<H: EventHandler>(&self, namespace: &str, event: &str, handler: H) {
        self.register_boxed(namespace, event, Arc::new(handler));
    }

    pub(crate) fn register_boxed(&self, namespace: &str, event: &str, handler: BoxedHandler) {
        let replaced = self
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .handlers
            .insert(event.to_string(), handler)
            .is_some();
        debug!(namespace = %namespace, event = %event, replaced, "Registered handler");
    }

    /// Install the authorization hook for `namespace`.
    pub fn set_guard<G>(&self, namespace: &str, guard: G)
    where
        G: Fn(&Socket, &str) -> bool + Send + Sync + 'static,
    {
        self.set_boxed_guard(namespace, Arc::new(guard));
    }

    pub(crate) fn set_boxed_guard(&self, namespace: &str, guard: Guard) {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .guard = Some(guard);
        info!(namespace = %namespace, "Installed namespace guard");
    }

    /// Check if clients may activate `namespace`.
    ///
    /// The default namespace is always valid; any other namespace needs at
    /// least one handler or a guard.
    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        namespace == DEFAULT_NAMESPACE || self.namespaces.contains_key(namespace)
    }

    /// Look up the handler for `event` in `namespace`.
    #[must_use]
    pub fn resolve_handler(&self, namespace: &str, event: &str) -> Option<BoxedHandler> {
        self.namespaces
            .get(namespace)
            .and_then(|entry| entry.handlers.get(event).cloned())
    }

    /// Ask the namespace guard whether `socket` may trigger `event`.
    #[must_use]
    pub fn is_allowed(&self, socket: &Socket, event: &str) -> bool {
        // Clone the guard out so it never runs under the shard lock.
        let guard = self
            .namespaces
            .get(socket.namespace())
            .and_then(|entry| entry.guard.clone());
        guard.map_or(true, |guard| guard(socket, event))
    }

    /// Event names registered for `namespace`.
    #[must_use]
    pub fn event_names(&self, namespace: &str) -> Vec<String> {
        self.namespaces
            .get(namespace)
            .map(|entry| entry.handlers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark `socket` as active.
    ///
    /// Returns the socket that was active for the same connection and
    /// namespace, if any.
    pub fn attach(&self, socket: Arc<Socket>) -> Option<Arc<Socket>> {
        let previous = self
            .connections
            .entry(socket.sid().clone())
            .or_default()
            .insert(socket.namespace().to_string(), Arc::clone(&socket));
        debug!(connection = %socket.sid(), namespace = %socket.namespace(), "Socket attached");
        previous
    }

    /// Remove `socket` from the active table.
    ///
    /// Returns `false` if it was not the active socket for its connection
    /// and namespace.
    pub fn detach(&self, socket: &Socket) -> bool {
        let sid = socket.sid();
        let removed = match self.connections.get_mut(sid) {
            Some(mut sockets) => {
                let is_current = sockets
                    .get(socket.namespace())
                    .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), socket));
                if is_current {
                    sockets.remove(socket.namespace());
                }
                is_current
            }
            None => false,
        };

        if removed {
            self.connections.remove_if(sid, |_, sockets| sockets.is_empty());
            debug!(connection = %sid, namespace = %socket.namespace(), "Socket detached");
        }
        removed
    }

    /// Get the active socket of connection `sid` in `namespace`.
    #[must_use]
    pub fn socket(&self, sid: &ConnectionId, namespace: &str) -> Option<Arc<Socket>> {
        self.connections
            .get(sid)
            .and_then(|sockets| sockets.get(namespace).cloned())
    }

    /// Every active socket of connection `sid`.
    #[must_use]
    pub fn sockets_of(&self, sid: &ConnectionId) -> Vec<Arc<Socket>> {
        self.connections
            .get(sid)
            .map(|sockets| sockets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every active socket in `namespace`, across all connections.
    ///
    /// Connections that have not activated the namespace are skipped.
    #[must_use]
    pub fn all_active_connections(&self, namespace: &str) -> Vec<Arc<Socket>> {
        self.connections
            .iter()
            .filter_map(|sockets| sockets.get(namespace).cloned())
            .filter(|socket| socket.is_connected())
            .collect()
    }

    /// Add `socket` to `room` in its namespace.
    ///
    /// Returns `true` if membership changed. Disconnected sockets are never
    /// added.
    pub fn join(&self, socket: &Arc<Socket>, room: &str) -> bool {
        let mut rooms = self
            .rooms
            .entry(socket.namespace().to_string())
            .or_default();

        // Checked under the namespace lock so a concurrent teardown cannot
        // miss a membership added here.
        if !socket.is_connected() {
            drop(rooms);
            self.rooms
                .remove_if(socket.namespace(), |_, rooms| rooms.is_empty());
            return false;
        }

        let members = rooms.entry(room.to_string()).or_default();
        if let Some(previous) = members.insert(socket.sid().clone(), Arc::clone(socket)) {
            if Arc::ptr_eq(&previous, socket) {
                return false;
            }
            // A stale socket of the same connection still held the slot.
            previous.remove_room(room);
        }
        socket.add_room(room);

        debug!(
            namespace = %socket.namespace(),
            room = %room,
            connection = %socket.sid(),
            members = members.len(),
            "Joined room"
        );
        true
    }

    /// Remove `socket` from `room` in its namespace.
    ///
    /// Returns `true` if it had been a member. Empty rooms are deleted, and
    /// an empty namespace room table is pruned.
    pub fn leave(&self, socket: &Socket, room: &str) -> bool {
        let namespace = socket.namespace();
        let Some(mut rooms) = self.rooms.get_mut(namespace) else {
            return false;
        };

        let removed = remove_member(&mut rooms, socket, room);
        let prune = rooms.is_empty();
        drop(rooms); // Release the lock

        if prune {
            self.rooms.remove_if(namespace, |_, rooms| rooms.is_empty());
        }
        removed
    }

    /// Remove `socket` from every room it is in.
    ///
    /// Returns the rooms it left.
    pub fn leave_all(&self, socket: &Socket) -> Vec<String> {
        let namespace = socket.namespace();
        let Some(mut rooms) = self.rooms.get_mut(namespace) else {
            return Vec::new();
        };

        // Iterate a stable copy: leaving mutates the socket's live set.
        let joined: Vec<String> = socket.rooms().into_iter().collect();
        let left: Vec<String> = joined
            .into_iter()
            .filter(|room| remove_member(&mut rooms, socket, room))
            .collect();
        let prune = rooms.is_empty();
        drop(rooms);

        if prune {
            self.rooms.remove_if(namespace, |_, rooms| rooms.is_empty());
        }
        debug!(connection = %socket.sid(), namespace = %namespace, rooms = left.len(), "Left all rooms");
        left
    }

    /// Snapshot of the members of `room` in `namespace`.
    ///
    /// Empty if the room does not exist.
    #[must_use]
    pub fn members_of(&self, namespace: &str, room: &str) -> Vec<Arc<Socket>> {
        self.rooms
            .get(namespace)
            .and_then(|rooms| rooms.get(room).map(|m| m.values().cloned().collect()))
            .unwrap_or_default()
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, namespace: &str, room: &str) -> usize {
        self.rooms
            .get(namespace)
            .and_then(|rooms| rooms.get(room).map(HashMap::len))
            .unwrap_or(0)
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, namespace: &str, room: &str) -> bool {
        self.rooms
            .get(namespace)
            .is_some_and(|rooms| rooms.contains_key(room))
    }

    /// Names of all rooms in `namespace`.
    #[must_use]
    pub fn room_names(&self, namespace: &str) -> Vec<String> {
        self.rooms
            .get(namespace)
            .map(|rooms| rooms.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let (room_count, total_memberships) = self.rooms.iter().fold((0, 0), |acc, rooms| {
            (
                acc.0 + rooms.len(),
                acc.1 + rooms.values().map(HashMap::len).sum::<usize>(),
            )
        });
        RegistryStats {
            namespace_count: self.namespaces.len(),
            room_count,
            connection_count: self.connections.len(),
            socket_count: self.connections.iter().map(|s| s.len()).sum(),
            total_memberships,
        }
    }
}

/// Remove one membership from a locked room table, keeping the socket's
/// mirror in step and deleting the room when it empties.
fn remove_member(rooms: &mut RoomTable, socket: &Socket, room: &str) -> bool {
    let Some(members) = rooms.get_mut(room) else {
        return false;
    };
    // Members are keyed by connection; only the socket holding the slot
    // may vacate it.
    let is_member = members
        .get(socket.sid())
        .is_some_and(|member| std::ptr::eq(Arc::as_ptr(member), socket));
    if !is_member {
        return false;
    }
    members.remove(socket.sid());
    socket.remove_room(room);

    debug!(
        namespace = %socket.namespace(),
        room = %room,
        connection = %socket.sid(),
        members = members.len(),
        "Left room"
    );

    if members.is_empty() {
        rooms.remove(room);
        debug!(namespace = %socket.namespace(), room = %room, "Deleted empty room");
    }
    true
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Namespaces with handlers or a guard.
    pub namespace_count: usize,
    /// Rooms across all namespaces.
    pub room_count: usize,
    /// Physical connections with at least one active socket.
    pub connection_count: usize,
    /// Active namespace sockets.
    pub socket_count: usize,
    /// Room memberships across all rooms.
    pub total_memberships: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::EventContext;
    use serde_json::Value;
    use switchboard_transport::outbound_channel;

    fn socket(sid: &str, namespace: &str) -> Arc<Socket> {
        let (tx, _rx) = outbound_channel();
        Arc::new(Socket::new(sid.into(), namespace, Arc::new(tx)))
    }

    async fn noop(_cx: EventContext, _args: Vec<Value>) -> crate::HandlerResult {
        Ok(Value::Null)
    }

    /// Every room has members, and both sides agree on every membership.
    fn assert_consistent(registry: &NamespaceRegistry, sockets: &[Arc<Socket>]) {
        for rooms in registry.rooms.iter() {
            assert!(!rooms.is_empty(), "empty namespace table retained");
            for (room, members) in rooms.iter() {
                assert!(!members.is_empty(), "empty room {room} retained");
                for member in members.values() {
                    assert!(member.in_room(room));
                }
            }
        }
        for socket in sockets {
            for room in socket.rooms() {
                let members = registry.members_of(socket.namespace(), &room);
                assert!(members.iter().any(|m| Arc::ptr_eq(m, socket)));
            }
        }
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = NamespaceRegistry::new();
        let a = socket("a", "");

        assert!(registry.join(&a, "lobby"));
        assert!(!registry.join(&a, "lobby"));
        assert_eq!(registry.member_count("", "lobby"), 1);
        assert!(a.in_room("lobby"));
        assert_consistent(&registry, &[a]);
    }

    #[test]
    fn test_leave_deletes_empty_room() {
        let registry = NamespaceRegistry::new();
        let a = socket("a", "");

        registry.join(&a, "lobby");
        assert!(registry.leave(&a, "lobby"));
        assert!(!registry.leave(&a, "lobby"));

        assert!(!registry.room_exists("", "lobby"));
        assert!(registry.members_of("", "lobby").is_empty());
        assert!(registry.rooms.is_empty());
    }

    #[test]
    fn test_room_survives_while_members_remain() {
        let registry = NamespaceRegistry::new();
        let a = socket("a", "");
        let b = socket("b", "");

        registry.join(&a, "lobby");
        registry.join(&b, "lobby");
        registry.leave(&a, "lobby");

        assert!(registry.room_exists("", "lobby"));
        assert_eq!(registry.member_count("", "lobby"), 1);
        assert_consistent(&registry, &[a, b]);
    }

    #[test]
    fn test_rooms_are_scoped_to_namespace() {
        let registry = NamespaceRegistry::new();
        let plain = socket("a", "");
        let chat = socket("a", "chat");

        registry.join(&plain, "lobby");
        registry.join(&chat, "lobby");
        registry.leave(&chat, "lobby");

        assert!(registry.room_exists("", "lobby"));
        assert!(!registry.room_exists("chat", "lobby"));
        assert!(plain.in_room("lobby"));
    }

    #[test]
    fn test_join_refused_after_disconnect() {
        let registry = NamespaceRegistry::new();
        let a = socket("a", "");
        a.mark_disconnected();

        assert!(!registry.join(&a, "lobby"));
        assert!(!registry.room_exists("", "lobby"));
        assert!(registry.rooms.is_empty());
    }

    #[test]
    fn test_stale_socket_cannot_leave_for_its_successor() {
        let registry = NamespaceRegistry::new();
        let old = socket("a", "");
        registry.join(&old, "lobby");
        old.mark_disconnected();
        registry.leave_all(&old);

        let new = socket("a", "");
        assert!(registry.join(&new, "lobby"));

        assert!(!registry.leave(&old, "lobby"));
        assert!(registry.leave_all(&old).is_empty());
        assert!(new.in_room("lobby"));
        assert_eq!(registry.member_count("", "lobby"), 1);
        assert_consistent(&registry, &[Arc::clone(&old), Arc::clone(&new)]);

        assert!(registry.leave(&new, "lobby"));
        assert!(registry.rooms.is_empty());
    }

    #[test]
    fn test_join_takes_over_slot_of_stale_socket() {
        let registry = NamespaceRegistry::new();
        let old = socket("a", "");
        let new = socket("a", "");
        registry.join(&old, "lobby");

        assert!(registry.join(&new, "lobby"));
        assert!(!old.in_room("lobby"));
        assert_eq!(registry.member_count("", "lobby"), 1);
        assert_consistent(&registry, &[old, new]);
    }

    #[test]
    fn test_leave_all() {
        let registry = NamespaceRegistry::new();
        let a = socket("a", "");
        let b = socket("b", "");

        registry.join(&a, "one");
        registry.join(&a, "two");
        registry.join(&b, "two");

        let mut left = registry.leave_all(&a);
        left.sort();
        assert_eq!(left, vec!["one".to_string(), "two".to_string()]);
        assert!(a.rooms().is_empty());
        assert!(!registry.room_exists("", "one"));
        assert_eq!(registry.member_count("", "two"), 1);
        assert_consistent(&registry, &[a, b]);
    }

    #[test]
    fn test_join_leave_sequences_stay_consistent() {
        let registry = NamespaceRegistry::new();
        let sockets: Vec<_> = (0..4).map(|i| socket(&format!("c{i}"), "")).collect();
        let rooms = ["r0", "r1", "r2"];

        // Deterministic pseudo-random walk over joins and leaves.
        let mut seed: u32 = 7;
        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let socket = &sockets[(seed >> 8) as usize % sockets.len()];
            let room = rooms[(seed >> 16) as usize % rooms.len()];
            let was_member = socket.in_room(room);

            if seed & 1 == 0 {
                assert_eq!(registry.join(socket, room), !was_member);
                assert!(socket.in_room(room));
            } else {
                assert_eq!(registry.leave(socket, room), was_member);
                assert!(!socket.in_room(room));
            }
            assert_consistent(&registry, &sockets);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_leave_keeps_memberships() {
        let registry = Arc::new(NamespaceRegistry::new());
        let sockets: Vec<_> = (0..8).map(|i| socket(&format!("c{i}"), "")).collect();

        let tasks: Vec<_> = sockets
            .iter()
            .enumerate()
            .map(|(i, socket)| {
                let registry = Arc::clone(&registry);
                let socket = Arc::clone(socket);
                tokio::spawn(async move {
                    let rooms = ["r0", "r1", "r2"];
                    let mut seed = i as u32 + 1;
                    for _ in 0..500 {
                        seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                        let room = rooms[(seed >> 16) as usize % rooms.len()];
                        if seed & 1 == 0 {
                            registry.join(&socket, room);
                        } else {
                            registry.leave(&socket, room);
                        }
                        tokio::task::yield_now().await;
                    }
                    // Every task ends in r0 so the final table is non-trivial.
                    registry.join(&socket, "r0");
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_consistent(&registry, &sockets);
        assert_eq!(registry.member_count("", "r0"), sockets.len());
        let mirrored: usize = sockets.iter().map(|s| s.rooms().len()).sum();
        assert_eq!(registry.stats().total_memberships, mirrored);

        for socket in &sockets {
            registry.leave_all(socket);
        }
        assert!(registry.rooms.is_empty());
    }

    #[test]
    fn test_handler_resolution() {
        let registry = NamespaceRegistry::new();
        registry.register_handler("chat", "greet", noop);

        assert!(registry.resolve_handler("chat", "greet").is_some());
        assert!(registry.resolve_handler("", "greet").is_none());
        assert!(registry.resolve_handler("chat", "other").is_none());
        assert_eq!(registry.event_names("chat"), vec!["greet".to_string()]);
    }

    #[test]
    fn test_namespace_validity() {
        let registry = NamespaceRegistry::new();
        assert!(registry.has_namespace(""));
        assert!(!registry.has_namespace("chat"));

        registry.register_handler("chat", "greet", noop);
        registry.set_guard("admin", |_, _| false);
        assert!(registry.has_namespace("chat"));
        assert!(registry.has_namespace("admin"));
    }

    #[test]
    fn test_guard() {
        let registry = NamespaceRegistry::new();
        registry.set_guard("chat", |_, event| event != "kick");
        let s = socket("a", "chat");
        let other = socket("a", "");

        assert!(registry.is_allowed(&s, "greet"));
        assert!(!registry.is_allowed(&s, "kick"));
        assert!(registry.is_allowed(&other, "kick"));
    }

    #[test]
    fn test_attach_detach() {
        let registry = NamespaceRegistry::new();
        let plain = socket("a", "");
        let chat = socket("a", "chat");
        let other = socket("b", "");

        assert!(registry.attach(Arc::clone(&plain)).is_none());
        registry.attach(Arc::clone(&chat));
        registry.attach(Arc::clone(&other));

        assert_eq!(registry.sockets_of(&"a".into()).len(), 2);
        assert_eq!(registry.all_active_connections("").len(), 2);
        assert_eq!(registry.all_active_connections("chat").len(), 1);
        assert!(registry.socket(&"a".into(), "chat").is_some());

        // A stale socket for the same slot is not removed by mistake.
        let stale = socket("a", "chat");
        assert!(!registry.detach(&stale));

        assert!(registry.detach(&chat));
        assert!(registry.detach(&plain));
        assert!(registry.sockets_of(&"a".into()).is_empty());
        assert_eq!(registry.stats().connection_count, 1);
    }

    #[test]
    fn test_registry_stats() {
        let registry = NamespaceRegistry::new();
        registry.register_handler("chat", "greet", noop);
        let a = socket("a", "");
        let b = socket("b", "");
        registry.attach(Arc::clone(&a));
        registry.attach(Arc::clone(&b));

        registry.join(&a, "one");
        registry.join(&a, "two");
        registry.join(&b, "one");

        let stats = registry.stats();
        assert_eq!(stats.namespace_count, 1);
        assert_eq!(stats.room_count, 2);
        assert_eq!(stats.connection_count, 2);
        assert_eq!(stats.socket_count, 2);
        assert_eq!(stats.total_memberships, 3);
    }
}
