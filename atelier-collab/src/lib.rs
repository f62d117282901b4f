//! # atelier-collab - real-time collaboration layer for Atelier
//!
//! Multi-user page editing over a websocket relay: CRDT document sync,
//! per-session presence, join-order leader election and cold-start recovery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     WebSocket      ┌─────────────┐
//! │ CollabSession │ ◄────────────────► │ SyncServer  │
//! │  SyncClient   │    bincode frames  │  (relay)    │
//! └──────┬────────┘                    └──────┬──────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌────────────────┐                  ┌────────────────┐
//! │ ComponentStore │                  │ ComponentStore │
//! │ PresenceChannel│                  │ (relay replica)│
//! │ LeaderElection │                  └───────┬────────┘
//! └────────────────┘                          │
//!                                     ┌───────┴────────┐
//!                                     │ BroadcastGroup │
//!                                     │ (fan-out)      │
//!                                     └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded [`SyncMessage`])
//! - [`broadcast`]: room registry and fan-out
//! - [`server`]: websocket relay server
//! - [`client`]: websocket transport for one session
//! - [`presence`]: ephemeral per-session state (cursor, selection, chat, claims)
//! - [`election`]: leader election over presence
//! - [`snapshot_source`]: persisted snapshot fetch
//! - [`recovery`]: exactly-once seeding of empty rooms
//! - [`session`]: the facade the editor uses

pub mod broadcast;
pub mod client;
pub mod election;
pub mod presence;
pub mod protocol;
pub mod recovery;
pub mod server;
pub mod session;
pub mod snapshot_source;

pub use broadcast::{BroadcastGroup, BroadcastStats, Room, RoomFull, RoomManager};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use election::{
    elect, find_adoptable_master, run_election, Candidate, Decision, ElectionConfig,
    ElectionHost, LeaderElection, Stabilizer, StabilizerStep,
};
pub use presence::{
    ChatMessage, CleanupRequest, Cursor, MasterState, MembershipChange, PresenceChannel,
    PresenceEntry, PresenceUpdate, PresenceUser, Selection, Viewport,
};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use recovery::{Recovery, RecoveryOutcome, SeedTarget};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{CollabSession, SessionConfig, SessionStatus, UserIdentity};
pub use snapshot_source::{HttpSnapshotSource, SnapshotError, SnapshotSource, StaticSnapshotSource};
