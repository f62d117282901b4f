//! Cold-start recovery: seed an empty room from its persisted snapshot.
//!
//! ```text
//! Connected (after first sync) ──► replica empty? ──► fetch ──► replace_all ──► broadcast
//! Error (local-only mode)      ──► local empty?   ──► fetch ──► hand records to the session
//! ```
//!
//! Runs at most once per session, however often the connection state
//! changes. Fetch failures leave the document empty; they are never
//! surfaced to the caller.
//!
//! A run is three steps: `begin` (latch), `fetch` (network, no locks held)
//! and `seed` (re-checks emptiness, then writes). Edits made while the fetch
//! is in flight win over the snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atelier_core::{normalize_snapshot, ComponentRecord, ComponentStore};

use crate::client::ConnectionState;
use crate::snapshot_source::SnapshotSource;

/// Where recovered records go.
pub enum SeedTarget<'a> {
    /// Seed the CRDT replica through one `replace_all` transaction.
    Replica(&'a ComponentStore),
    /// Local-only mode: bypass the CRDT and hand records to the caller.
    Direct {
        is_empty: bool,
        apply: &'a (dyn Fn(Vec<ComponentRecord>) + Send + Sync),
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Connection state that never triggers recovery
    NotApplicable,
    /// Latch already set by an earlier call
    AlreadyRan,
    /// Document had content; nothing fetched
    NotEmpty,
    /// No usable snapshot (missing, unreadable, or empty)
    NothingToSeed,
    /// Seeded `count` records; `update` is the replica delta to broadcast
    Seeded {
        count: usize,
        update: Option<Vec<u8>>,
    },
}

pub struct Recovery {
    done: AtomicBool,
    source: Arc<dyn SnapshotSource>,
    room_id: String,
    author_id: String,
}

impl Recovery {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        room_id: impl Into<String>,
        author_id: impl Into<String>,
    ) -> Self {
        Self {
            done: AtomicBool::new(false),
            source,
            room_id: room_id.into(),
            author_id: author_id.into(),
        }
    }

    pub fn has_run(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Connection-state observer. Trips the latch when `state` is
    /// `Connected` or `Error` and the document is empty; `Ok` means the
    /// caller should go on to [`fetch`](Self::fetch).
    pub fn begin(&self, state: ConnectionState, is_empty: bool) -> Result<(), RecoveryOutcome> {
        if !matches!(state, ConnectionState::Connected | ConnectionState::Error) {
            return Err(RecoveryOutcome::NotApplicable);
        }
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RecoveryOutcome::AlreadyRan);
        }
        if !is_empty {
            log::debug!("room {} already has content, skipping recovery", self.room_id);
            return Err(RecoveryOutcome::NotEmpty);
        }
        Ok(())
    }

    /// Fetch and normalize the snapshot. Must not be awaited while holding
    /// the store.
    pub async fn fetch(&self) -> Result<Vec<ComponentRecord>, RecoveryOutcome> {
        let records = match self.source.fetch(&self.room_id).await {
            Ok(Some(snapshot)) => normalize_snapshot(&snapshot, &self.author_id),
            Ok(None) => {
                log::debug!("no persisted snapshot for room {}", self.room_id);
                Vec::new()
            }
            Err(e) => {
                log::warn!("snapshot fetch for room {} failed: {e}", self.room_id);
                Vec::new()
            }
        };
        if records.is_empty() {
            return Err(RecoveryOutcome::NothingToSeed);
        }
        Ok(records)
    }

    /// Seed `target` unless it gained content while the fetch was running.
    pub fn seed(&self, records: Vec<ComponentRecord>, target: SeedTarget<'_>) -> RecoveryOutcome {
        let count = records.len();
        match target {
            SeedTarget::Replica(store) => {
                if !store.is_empty() {
                    log::debug!("room {} filled during recovery, not seeding", self.room_id);
                    return RecoveryOutcome::NotEmpty;
                }
                match store.replace_all(&records) {
                    Ok(update) => {
                        log::info!("seeded room {} with {count} components", self.room_id);
                        RecoveryOutcome::Seeded {
                            count,
                            update: Some(update),
                        }
                    }
                    Err(e) => {
                        log::warn!("could not seed room {}: {e}", self.room_id);
                        RecoveryOutcome::NothingToSeed
                    }
                }
            }
            SeedTarget::Direct { is_empty, apply } => {
                if !is_empty {
                    log::debug!("room {} filled during recovery, not seeding", self.room_id);
                    return RecoveryOutcome::NotEmpty;
                }
                log::info!("loaded {count} components for room {} in local mode", self.room_id);
                apply(records);
                RecoveryOutcome::Seeded {
                    count,
                    update: None,
                }
            }
        }
    }
}
