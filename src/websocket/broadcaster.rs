//! Room-keyed event broadcaster.
//!
//! Subscribers register a bounded send queue and join rooms
//! (`instrument:<id>`, `user:<id>`). Publishing stamps each frame with a
//! strictly monotonic `server_sequence` and enqueues it on every member's
//! queue without waiting; a subscriber whose queue is full or closed is
//! evicted so one slow consumer never stalls the rest. The matching engine
//! hands over its post-commit event batch here and returns immediately —
//! actual socket writes happen on each connection's own task.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::events::OutboundEvent;

/// A parsed room name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    Instrument(Uuid),
    User(Uuid),
}

impl Room {
    pub fn parse(name: &str) -> Option<Room> {
        if let Some(rest) = name.strip_prefix("instrument:") {
            return Uuid::parse_str(rest).ok().map(Room::Instrument);
        }
        if let Some(rest) = name.strip_prefix("user:") {
            return Uuid::parse_str(rest).ok().map(Room::User);
        }
        None
    }
}

pub fn instrument_room(bond_id: Uuid) -> String {
    format!("instrument:{}", bond_id)
}

pub fn user_room(user_id: Uuid) -> String {
    format!("user:{}", user_id)
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    user_id: Option<Uuid>,
}

/// Connection and room statistics, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RoomStats {
    pub total_connections: usize,
    pub authenticated_connections: usize,
    pub active_rooms: usize,
    pub rooms: HashMap<String, usize>,
}

#[derive(Serialize)]
struct Frame<'a> {
    #[serde(flatten)]
    event: &'a OutboundEvent,
    server_sequence: u64,
}

pub struct Broadcaster {
    connections: DashMap<Uuid, Subscriber>,
    rooms: DashMap<String, HashSet<Uuid>>,
    sequence: AtomicU64,
    queue_capacity: usize,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            sequence: AtomicU64::new(0),
            queue_capacity,
        }
    }

    /// Register a connection and hand back its id plus the frame stream the
    /// connection task should drain to the socket.
    pub fn register(&self, user_id: Option<Uuid>) -> (Uuid, mpsc::Receiver<String>) {
        let connection_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.connections
            .insert(connection_id, Subscriber { tx, user_id });
        tracing::info!("WebSocket connected: {} (user: {:?})", connection_id, user_id);
        (connection_id, rx)
    }

    /// Drop a connection and its room memberships.
    pub fn unregister(&self, connection_id: Uuid) {
        self.connections.remove(&connection_id);
        self.rooms.retain(|_, members| {
            members.remove(&connection_id);
            !members.is_empty()
        });
        tracing::info!("WebSocket disconnected: {}", connection_id);
    }

    pub fn join_room(&self, connection_id: Uuid, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        tracing::debug!("Connection {} joined room {}", connection_id, room);
    }

    pub fn leave_room(&self, connection_id: Uuid, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
        }
        self.rooms.retain(|_, members| !members.is_empty());
        tracing::debug!("Connection {} left room {}", connection_id, room);
    }

    fn encode(&self, event: &OutboundEvent) -> Result<String, serde_json::Error> {
        let frame = Frame {
            event,
            server_sequence: self.sequence.fetch_add(1, AtomicOrdering::SeqCst),
        };
        serde_json::to_string(&frame)
    }

    /// Send one frame to one connection. Returns false (and evicts) if the
    /// subscriber's queue is full or gone.
    pub fn send_to(&self, connection_id: Uuid, event: &OutboundEvent) -> bool {
        let text = match self.encode(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode frame: {}", e);
                return false;
            }
        };
        let ok = match self.connections.get(&connection_id) {
            Some(subscriber) => subscriber.tx.try_send(text).is_ok(),
            None => return false,
        };
        if !ok {
            tracing::warn!("Evicting unresponsive subscriber {}", connection_id);
            self.unregister(connection_id);
        }
        ok
    }

    /// Fan one event out to every member of a room. A failed send evicts
    /// that subscriber and delivery to the others continues.
    pub fn broadcast_to_room(&self, room: &str, event: &OutboundEvent) {
        let members: Vec<Uuid> = match self.rooms.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };

        let text = match self.encode(event) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode frame for room {}: {}", room, e);
                return;
            }
        };
        let mut evicted = Vec::new();
        for connection_id in members {
            let delivered = self
                .connections
                .get(&connection_id)
                .map(|s| s.tx.try_send(text.clone()).is_ok())
                .unwrap_or(false);
            if !delivered {
                evicted.push(connection_id);
            }
        }
        for connection_id in evicted {
            tracing::warn!("Evicting unresponsive subscriber {}", connection_id);
            self.unregister(connection_id);
        }
    }

    /// Publish an ordered batch of room events. Frames are sequenced in
    /// batch order, so every subscriber of a room observes the batch in the
    /// order the engine produced it.
    pub fn publish_batch(&self, batch: Vec<(String, OutboundEvent)>) {
        for (room, event) in batch {
            self.broadcast_to_room(&room, &event);
        }
    }

    pub fn stats(&self) -> RoomStats {
        RoomStats {
            total_connections: self.connections.len(),
            authenticated_connections: self
                .connections
                .iter()
                .filter(|c| c.user_id.is_some())
                .count(),
            active_rooms: self.rooms.len(),
            rooms: self
                .rooms
                .iter()
                .map(|e| (e.key().clone(), e.value().len()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recv_json(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
        let text = rx.try_recv().expect("expected a frame");
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn test_room_parse() {
        let id = Uuid::new_v4();
        assert_eq!(
            Room::parse(&format!("instrument:{}", id)),
            Some(Room::Instrument(id))
        );
        assert_eq!(Room::parse(&format!("user:{}", id)), Some(Room::User(id)));
        assert_eq!(Room::parse("ticker:xyz"), None);
        assert_eq!(Room::parse("instrument:not-a-uuid"), None);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_members_only() {
        let broadcaster = Broadcaster::new(8);
        let bond = Uuid::new_v4();
        let (in_room, mut rx_in) = broadcaster.register(None);
        let (_out_of_room, mut rx_out) = broadcaster.register(None);
        broadcaster.join_room(in_room, &instrument_room(bond));

        broadcaster.broadcast_to_room(
            &instrument_room(bond),
            &OutboundEvent::PortfolioUpdate,
        );

        assert!(rx_in.try_recv().is_ok());
        assert!(rx_out.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_sequence_is_strictly_monotonic() {
        let broadcaster = Broadcaster::new(8);
        let (conn, mut rx) = broadcaster.register(None);
        let room = user_room(Uuid::new_v4());
        broadcaster.join_room(conn, &room);

        broadcaster.broadcast_to_room(&room, &OutboundEvent::PortfolioUpdate);
        broadcaster.broadcast_to_room(&room, &OutboundEvent::PortfolioUpdate);

        let first = recv_json(&mut rx)["server_sequence"].as_u64().unwrap();
        let second = recv_json(&mut rx)["server_sequence"].as_u64().unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_subscriber_without_blocking_others() {
        let broadcaster = Broadcaster::new(1);
        let room = instrument_room(Uuid::new_v4());
        let (slow, _rx_slow) = broadcaster.register(None);
        let (healthy, mut rx_healthy) = broadcaster.register(None);
        broadcaster.join_room(slow, &room);
        broadcaster.join_room(healthy, &room);

        // first frame fills the slow queue, second overflows it
        broadcaster.broadcast_to_room(&room, &OutboundEvent::PortfolioUpdate);
        broadcaster.broadcast_to_room(&room, &OutboundEvent::PortfolioUpdate);

        assert_eq!(broadcaster.stats().total_connections, 1);
        assert!(rx_healthy.try_recv().is_ok());
        assert!(rx_healthy.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_leave_room_stops_delivery() {
        let broadcaster = Broadcaster::new(8);
        let room = instrument_room(Uuid::new_v4());
        let (conn, mut rx) = broadcaster.register(None);
        broadcaster.join_room(conn, &room);
        broadcaster.leave_room(conn, &room);

        broadcaster.broadcast_to_room(&room, &OutboundEvent::PortfolioUpdate);
        assert!(rx.try_recv().is_err());
    }
}
