//! Presence channel: one ephemeral entry per connected session.
//!
//! ```text
//! local write                         remote frame
//!     │                                    │
//!     ▼                                    ▼
//! update_local(|entry| …)           apply_remote(PresenceUpdate)
//!     │  clock += 1                        │  stale clock? drop
//!     ▼                                    ▼
//! PresenceUpdate ──► transport      MembershipChange ──► election
//! ```
//!
//! Each session writes only its own entry; every write ships the whole entry
//! with a per-owner clock, so receivers can drop reordered or replayed frames.
//! Entries vanish when the relay reports the owner gone (`remove_peer`).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Entry fields
// ───────────────────────────────────────────────────────────────────

/// Identity published by a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    pub color: String,
    /// Milliseconds since the epoch plus a random fraction; set once per
    /// session and never updated. Smallest join time leads the room.
    pub join_time: f64,
    pub session_id: String,
}

impl PresenceUser {
    /// Register a user for a new session, stamping a fresh join time.
    pub fn register(
        id: impl Into<String>,
        name: impl Into<String>,
        color: impl Into<String>,
        session_id: Uuid,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
            join_time: join_timestamp(),
            session_id: session_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub component_ids: Vec<String>,
    pub viewport: Option<Viewport>,
}

/// Transient chat bubble shown at the author's cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub message: String,
    pub user: PresenceUser,
    pub timestamp: u64,
    pub position: Cursor,
}

/// Leadership claim published by the elected master only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterState {
    /// User id of the master.
    pub master_id: String,
    pub master_name: String,
    pub elected_at: u64,
    pub total_users: u32,
    /// Session that computed and published the claim.
    pub elected_by: String,
    pub version: u64,
}

/// Ask every other session to drop its stale `global_master_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    /// User id of the master issuing the request.
    pub requested_by: String,
    pub version: u64,
    pub timestamp: u64,
}

/// Everything a session broadcasts about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user: Option<PresenceUser>,
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub chat_message: Option<ChatMessage>,
    pub global_master_state: Option<MasterState>,
    pub cleanup_request: Option<CleanupRequest>,
}

impl PresenceEntry {
    /// User id, if the session has registered one.
    pub fn user_id(&self) -> Option<&str> {
        self.user
            .as_ref()
            .map(|u| u.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// A session's whole entry at a given clock, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub session_id: Uuid,
    pub clock: u64,
    pub entry: PresenceEntry,
}

/// How an incoming frame changed the set of registered users.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Session now has a registered user (first time seen with one).
    Added(Uuid),
    /// Existing member changed other fields.
    Updated(Uuid),
    /// Session is gone.
    Removed(Uuid),
}

impl MembershipChange {
    /// Whether the change alters who is in the room.
    pub fn is_membership(&self) -> bool {
        !matches!(self, MembershipChange::Updated(_))
    }
}

/// Milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Join time with random fractional jitter, so independently generated
/// timestamps practically never tie.
pub fn join_timestamp() -> f64 {
    now_millis() as f64 + rand::random::<f64>()
}

/// Total order on join times.
pub fn compare_join_time(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

// ───────────────────────────────────────────────────────────────────
// Channel
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TrackedEntry {
    clock: u64,
    entry: PresenceEntry,
}

/// Local view of a room's presence space.
pub struct PresenceChannel {
    local_session: Uuid,
    local_clock: u64,
    local: PresenceEntry,
    remote: HashMap<Uuid, TrackedEntry>,
    cursor_throttle: Duration,
    last_cursor_broadcast: Option<Instant>,
}

impl PresenceChannel {
    pub fn new(local_session: Uuid, cursor_throttle: Duration) -> Self {
        Self {
            local_session,
            local_clock: 0,
            local: PresenceEntry::default(),
            remote: HashMap::new(),
            cursor_throttle,
            last_cursor_broadcast: None,
        }
    }

    pub fn local_session(&self) -> Uuid {
        self.local_session
    }

    pub fn local_entry(&self) -> &PresenceEntry {
        &self.local
    }

    /// Mutate the local entry and produce the frame to broadcast.
    pub fn update_local(&mut self, f: impl FnOnce(&mut PresenceEntry)) -> PresenceUpdate {
        f(&mut self.local);
        self.local_update()
    }

    /// Re-announce the local entry under a fresh clock.
    pub fn local_update(&mut self) -> PresenceUpdate {
        self.local_clock += 1;
        PresenceUpdate {
            session_id: self.local_session,
            clock: self.local_clock,
            entry: self.local.clone(),
        }
    }

    /// Record the cursor; returns a frame unless throttled. A throttled
    /// position still rides along with the next frame.
    pub fn update_local_cursor(&mut self, x: f64, y: f64) -> Option<PresenceUpdate> {
        self.local.cursor = Some(Cursor { x, y });

        let now = Instant::now();
        if let Some(last) = self.last_cursor_broadcast {
            if now.duration_since(last) < self.cursor_throttle {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(now);
        Some(self.local_update())
    }

    pub fn update_local_selection(
        &mut self,
        component_ids: Vec<String>,
        viewport: Option<Viewport>,
    ) -> PresenceUpdate {
        self.update_local(|entry| {
            entry.selection = Some(Selection {
                component_ids,
                viewport,
            })
        })
    }

    /// Apply a remote frame. `None` when it is ours or stale.
    pub fn apply_remote(&mut self, update: PresenceUpdate) -> Option<MembershipChange> {
        let session = update.session_id;
        if session == self.local_session {
            return None;
        }

        let was_member = match self.remote.get(&session) {
            Some(tracked) if tracked.clock >= update.clock => return None,
            Some(tracked) => tracked.entry.user_id().is_some(),
            None => false,
        };
        let is_member = update.entry.user_id().is_some();

        self.remote.insert(
            session,
            TrackedEntry {
                clock: update.clock,
                entry: update.entry,
            },
        );

        Some(if is_member && !was_member {
            MembershipChange::Added(session)
        } else {
            MembershipChange::Updated(session)
        })
    }

    /// Drop a departed session's entry.
    pub fn remove_peer(&mut self, session: &Uuid) -> Option<MembershipChange> {
        self.remote
            .remove(session)
            .map(|_| MembershipChange::Removed(*session))
    }

    /// Drop every remote entry (transport lost).
    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Entry of one session, local included.
    pub fn entry(&self, session: &Uuid) -> Option<&PresenceEntry> {
        if *session == self.local_session {
            Some(&self.local)
        } else {
            self.remote.get(session).map(|t| &t.entry)
        }
    }

    /// All entries, local first.
    pub fn entries(&self) -> impl Iterator<Item = (&Uuid, &PresenceEntry)> {
        std::iter::once((&self.local_session, &self.local))
            .chain(self.remote.iter().map(|(id, t)| (id, &t.entry)))
    }

    /// Owned copy of all entries, for handing to the election.
    pub fn snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
        self.entries().map(|(id, e)| (*id, e.clone())).collect()
    }

    /// Registered users, one per user id (earliest join kept), oldest first.
    pub fn active_users(&self) -> Vec<PresenceUser> {
        let mut by_id: HashMap<&str, &PresenceUser> = HashMap::new();
        for user in self.entries().filter_map(|(_, e)| e.user.as_ref()) {
            if user.id.is_empty() {
                continue;
            }
            by_id
                .entry(user.id.as_str())
                .and_modify(|kept| {
                    if user.join_time < kept.join_time {
                        *kept = user;
                    }
                })
                .or_insert(user);
        }

        let mut users: Vec<PresenceUser> = by_id.into_values().cloned().collect();
        users.sort_by(|a, b| compare_join_time(a.join_time, b.join_time));
        users
    }
}

// ===================================================================
// Tests
// ===================================================================
