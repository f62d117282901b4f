//! Binary protocol for document sync and presence.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes   │ len+utf8 │ varint   │ variable │
//! └──────────┴────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake on join:
//! ```text
//! client                               server
//!   │── PeerJoined(PeerInfo) ────────────►│
//!   │── SyncStep1(client sv) ────────────►│
//!   │◄──────────── SyncStep2(diff) ───────│
//!   │◄──────────── SyncStep1(server sv) ──│
//!   │◄──────────── Presence × peers ──────│
//!   │── SyncStep2(offline edits) ────────►│
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceUpdate;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector: "send me what I am missing"
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Full presence entry of the sending session
    Presence = 4,
    /// Session joined a room
    PeerJoined = 5,
    /// Session left a room; its presence entry is gone
    PeerLeft = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Identity of a connected session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    /// Transport-level id, unique per connection.
    pub session_id: Uuid,
    /// Application user id (stable across sessions).
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_session(Uuid::new_v4(), user_id, name)
    }

    /// Create with explicit session id (for testing)
    pub fn with_session(
        session_id: Uuid,
        user_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            session_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub room_id: String,
    /// Per-sender sequence number (presence clock for Presence frames)
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(
        msg_type: MessageType,
        session_id: Uuid,
        room_id: &str,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            session_id,
            room_id: room_id.to_string(),
            clock,
            payload,
        }
    }

    /// Create an incremental update message.
    pub fn update(session_id: Uuid, room_id: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, session_id, room_id, clock, yrs_update)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(session_id: Uuid, room_id: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, session_id, room_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(session_id: Uuid, room_id: &str, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, session_id, room_id, 0, state_diff)
    }

    /// Create a presence message carrying the sender's whole entry.
    pub fn presence(room_id: &str, update: &PresenceUpdate) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(update, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(
            MessageType::Presence,
            update.session_id,
            room_id,
            update.clock,
            payload,
        ))
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room_id: &str, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.session_id, room_id, 0, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(session_id: Uuid, room_id: &str) -> Self {
        Self::new(MessageType::PeerLeft, session_id, room_id, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(session_id: Uuid) -> Self {
        Self::new(MessageType::Ping, session_id, "", 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(session_id: Uuid) -> Self {
        Self::new(MessageType::Pong, session_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse presence payload.
    pub fn presence_update(&self) -> Result<PresenceUpdate, ProtocolError> {
        if self.msg_type != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (update, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(update)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol and transport errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
