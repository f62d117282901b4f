//! Room fan-out: one broadcast channel per page, plus the relay replica.
//!
//! ```text
//!                 ┌───────────────── Room (room_id) ─────────────────┐
//! session A ──►   │ replica: ComponentStore   group: BroadcastGroup  │ ──► A, B, C
//!                 │                           peers + last presence  │
//!                 └──────────────────────────────────────────────────┘
//! ```
//!
//! Every peer subscribes to the same tokio broadcast channel; filtering out
//! the sender's own frames is the connection handler's job. Lagging peers
//! drop the oldest frames once `capacity` is exceeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use atelier_core::ComponentStore;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_peers: usize,
}

/// Join refused because the room is at capacity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("room {room_id} is full ({max_peers} peers)")]
pub struct RoomFull {
    pub room_id: String,
    pub max_peers: usize,
}

struct RoomPeer {
    info: PeerInfo,
    /// Last encoded Presence frame, replayed to late joiners.
    presence: Option<Arc<Vec<u8>>>,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, RoomPeer>>,
    capacity: usize,
    max_peers: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a peer and return its receiver. A session that is already present
    /// is re-registered without counting against the limit.
    pub async fn add_peer(
        &self,
        room_id: &str,
        info: PeerInfo,
    ) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, RoomFull> {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&info.session_id) && peers.len() >= self.max_peers {
            return Err(RoomFull {
                room_id: room_id.to_string(),
                max_peers: self.max_peers,
            });
        }
        peers.insert(
            info.session_id,
            RoomPeer {
                info,
                presence: None,
            },
        );
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, session_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(session_id).map(|p| p.info)
    }

    /// Remember a peer's latest Presence frame.
    pub async fn record_presence(&self, session_id: &Uuid, frame: Arc<Vec<u8>>) {
        if let Some(peer) = self.peers.write().await.get_mut(session_id) {
            peer.presence = Some(frame);
        }
    }

    /// Latest Presence frames of every peer except `session_id`.
    pub async fn presence_frames_except(&self, session_id: &Uuid) -> Vec<Arc<Vec<u8>>> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|(id, _)| *id != session_id)
            .filter_map(|(_, peer)| peer.presence.clone())
            .collect()
    }

    /// Encode once and fan out. Returns the number of receivers.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Fan out pre-encoded bytes.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect()
    }

    pub async fn has_peer(&self, session_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Relay-side state of one page: the merged replica and its peers.
pub struct Room {
    pub replica: Mutex<ComponentStore>,
    pub group: BroadcastGroup,
}

impl Room {
    fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            replica: Mutex::new(ComponentStore::new()),
            group: BroadcastGroup::new(capacity, max_peers),
        }
    }
}

/// Maps room ids to rooms. Rooms are created on first join and dropped
/// when their last peer leaves; nothing outlives the last connection.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Get or create a room without joining it.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(room_id) {
            return room.clone();
        }
        let room = Arc::new(Room::new(self.capacity, self.max_peers));
        rooms.insert(room_id.to_string(), room.clone());
        room
    }

    /// Join a room, creating it if needed. Holds the map lock so a
    /// concurrent `leave` cannot drop the room between lookup and join.
    pub async fn join(
        &self,
        room_id: &str,
        info: PeerInfo,
    ) -> Result<(Arc<Room>, broadcast::Receiver<Arc<Vec<u8>>>), RoomFull> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(Room::new(self.capacity, self.max_peers)))
            .clone();

        match room.group.add_peer(room_id, info).await {
            Ok(rx) => Ok((room, rx)),
            Err(full) => {
                if room.group.peer_count().await == 0 {
                    rooms.remove(room_id);
                }
                Err(full)
            }
        }
    }

    /// Remove a peer and announce its departure. Returns true when the
    /// room was empty afterwards and got dropped.
    pub async fn leave(&self, room_id: &str, session_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(room_id).cloned() else {
            return false;
        };

        if room.group.remove_peer(session_id).await.is_some() {
            if let Err(e) = room.group.broadcast(&SyncMessage::peer_left(*session_id, room_id)) {
                log::warn!("failed to announce departure of {session_id}: {e}");
            }
        }

        if room.group.peer_count().await == 0 {
            rooms.remove(room_id);
            log::info!("room {room_id} removed (empty)");
            return true;
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
