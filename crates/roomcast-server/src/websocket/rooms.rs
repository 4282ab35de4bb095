//! Room membership index.
//!
//! Membership is a many-to-many relation between connections and rooms.
//! Both directions live in one [`Membership`] behind a single lock, so every
//! operation updates room → members and connection → rooms together.
//!
//! A room exists only while it has at least one subscriber: it is created on
//! first subscribe and deleted when its last member leaves.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::Mutex;
use roomcast_core::{ConnectionId, RoomId};

#[derive(Default)]
struct Membership {
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, BTreeSet<RoomId>>,
}

/// Maps rooms to their subscribers and connections to their rooms.
#[derive(Default)]
pub struct RoomIndex {
    inner: Mutex<Membership>,
}

impl RoomIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn` to `room`, creating the room if needed.
    ///
    /// Returns `false` if the connection was already a member.
    pub fn subscribe(&self, conn: &ConnectionId, room: RoomId) -> bool {
        let mut m = self.inner.lock();
        let added = m.rooms.entry(room).or_default().insert(conn.clone());
        if added {
            let _ = m.by_connection.entry(conn.clone()).or_default().insert(room);
        }
        added
    }

    /// Remove `conn` from `room`, deleting the room if it empties.
    ///
    /// Returns `false` if the connection was not a member.
    pub fn unsubscribe(&self, conn: &ConnectionId, room: RoomId) -> bool {
        let mut m = self.inner.lock();
        let Some(members) = m.rooms.get_mut(&room) else {
            return false;
        };
        if !members.remove(conn) {
            return false;
        }
        if members.is_empty() {
            let _ = m.rooms.remove(&room);
        }
        if let Some(joined) = m.by_connection.get_mut(conn) {
            let _ = joined.remove(&room);
            if joined.is_empty() {
                let _ = m.by_connection.remove(conn);
            }
        }
        true
    }

    /// Subscribers of `room`. Unknown rooms yield an empty set.
    pub fn members_of(&self, room: RoomId) -> HashSet<ConnectionId> {
        self.inner
            .lock()
            .rooms
            .get(&room)
            .cloned()
            .unwrap_or_default()
    }

    /// Rooms `conn` is subscribed to, in ascending order.
    pub fn rooms_of(&self, conn: &ConnectionId) -> BTreeSet<RoomId> {
        self.inner
            .lock()
            .by_connection
            .get(conn)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop `conn` from every room it joined. Returns the rooms it left.
    pub fn remove_connection_everywhere(&self, conn: &ConnectionId) -> BTreeSet<RoomId> {
        let mut m = self.inner.lock();
        let Some(joined) = m.by_connection.remove(conn) else {
            return BTreeSet::new();
        };
        for room in &joined {
            if let Some(members) = m.rooms.get_mut(room) {
                let _ = members.remove(conn);
                if members.is_empty() {
                    let _ = m.rooms.remove(room);
                }
            }
        }
        joined
    }

    /// Whether `room` currently has subscribers.
    pub fn contains_room(&self, room: RoomId) -> bool {
        self.inner.lock().rooms.contains_key(&room)
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.inner.lock().rooms.len()
    }

    /// Total (connection, room) pairs.
    pub fn subscription_count(&self) -> usize {
        self.inner.lock().rooms.values().map(HashSet::len).sum()
    }

    /// Subscriber count per room, ordered by room id.
    pub fn room_sizes(&self) -> BTreeMap<RoomId, usize> {
        self.inner
            .lock()
            .rooms
            .iter()
            .map(|(room, members)| (*room, members.len()))
            .collect()
    }

    /// Both directions agree and no empty entries linger.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let m = self.inner.lock();
        let forward = m.rooms.iter().all(|(room, members)| {
            !members.is_empty()
                && members
                    .iter()
                    .all(|c| m.by_connection.get(c).is_some_and(|r| r.contains(room)))
        });
        let backward = m.by_connection.iter().all(|(conn, rooms)| {
            !rooms.is_empty()
                && rooms
                    .iter()
                    .all(|r| m.rooms.get(r).is_some_and(|members| members.contains(conn)))
        });
        forward && backward
    }
}
