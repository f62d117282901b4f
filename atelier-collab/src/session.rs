//! Collaboration facade: the one object the editor talks to.
//!
//! ```text
//!            add/update/remove/replace        cursor/selection/chat
//!                       │                               │
//!                       ▼                               ▼
//!  ┌───────────── CollabSession ──────────────────────────────────┐
//!  │ ComponentStore ◄── SyncEvent loop ──► PresenceChannel        │
//!  │      │                  │                    │               │
//!  │  Recovery (once)    SyncClient        LeaderElection (re-run │
//!  │                                        on membership change) │
//!  └──────────────────────────┬───────────────────────────────────┘
//!                             ▼
//!          watch<Vec<ComponentRecord>>   watch<SessionStatus>
//! ```
//!
//! Mutations always land in the local replica first and never fail from
//! the caller's point of view; when the transport is down they simply stay
//! local. Errors are logged and absorbed here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use atelier_core::{ComponentPatch, ComponentRecord, ComponentStore};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{ConnectionState, SyncClient, SyncEvent};
use crate::election::{run_election, Decision, ElectionConfig, ElectionHost, LeaderElection};
use crate::presence::{
    now_millis, ChatMessage, PresenceChannel, PresenceEntry, PresenceUpdate, PresenceUser,
    Viewport,
};
use crate::protocol::PeerInfo;
use crate::recovery::{Recovery, RecoveryOutcome, SeedTarget};
use crate::snapshot_source::SnapshotSource;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay websocket url, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub connect_timeout: Duration,
    /// Minimum gap between cursor broadcasts
    pub cursor_throttle: Duration,
    /// How long a chat bubble stays up
    pub chat_ttl: Duration,
    /// Transport event channel capacity
    pub event_capacity: usize,
    pub election: ElectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(5),
            cursor_throttle: Duration::from_millis(33),
            chat_ttl: Duration::from_secs(5),
            event_capacity: 256,
            election: ElectionConfig::default(),
        }
    }
}

/// Identity handed in by the surrounding auth layer.
#[derive(Debug, Clone, PartialEq)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
        }
    }
}

/// Everything the UI needs to know about the session's health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub connected: bool,
    /// Set once the transport failed; the session is in local-only mode.
    pub connection_error: Option<String>,
    pub is_master: bool,
    pub master_user_id: Option<String>,
}

#[derive(Default)]
struct Tasks {
    events: Option<JoinHandle<()>>,
    election: Option<JoinHandle<()>>,
    chat_clear: Option<JoinHandle<()>>,
    recovery: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.events.take(),
            self.election.take(),
            self.chat_clear.take(),
            self.recovery.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Shared {
    session_id: Uuid,
    room_id: String,
    identity: UserIdentity,
    config: SessionConfig,

    store: Mutex<ComponentStore>,
    presence: Mutex<PresenceChannel>,
    election: Mutex<LeaderElection>,
    client: RwLock<Option<SyncClient>>,
    recovery: Recovery,
    /// Set by the first SyncStep2 from the relay
    synced: AtomicBool,

    components_tx: watch::Sender<Vec<ComponentRecord>>,
    status_tx: watch::Sender<SessionStatus>,
    tasks: StdMutex<Tasks>,
}

/// A user's live editing session in one room.
pub struct CollabSession {
    shared: Arc<Shared>,
}

impl CollabSession {
    /// Register, connect, and start electing. Never fails: when the relay is
    /// unreachable the session comes up in local-only mode.
    pub async fn start(
        config: SessionConfig,
        identity: UserIdentity,
        room_id: impl Into<String>,
        snapshots: Arc<dyn SnapshotSource>,
    ) -> Self {
        let room_id = room_id.into();
        let session_id = Uuid::new_v4();

        let mut election = LeaderElection::new(session_id);
        let user = election.register(&identity.id, &identity.name, &identity.color);
        let mut presence = PresenceChannel::new(session_id, config.cursor_throttle);
        presence.update_local(|entry| entry.user = Some(user));

        let mut client = SyncClient::new(
            PeerInfo::with_session(session_id, identity.id.as_str(), identity.name.as_str()),
            room_id.as_str(),
            config.server_url.as_str(),
            config.connect_timeout,
            config.event_capacity,
        );
        let events = client.take_event_rx();

        let shared = Arc::new(Shared {
            session_id,
            recovery: Recovery::new(snapshots, room_id.as_str(), identity.id.as_str()),
            room_id,
            identity,
            config,
            store: Mutex::new(ComponentStore::new()),
            presence: Mutex::new(presence),
            election: Mutex::new(election),
            client: RwLock::new(None),
            synced: AtomicBool::new(false),
            components_tx: watch::channel(Vec::new()).0,
            status_tx: watch::channel(SessionStatus::default()).0,
            tasks: StdMutex::new(Tasks::default()),
        });

        let state_vector = shared.store.lock().await.state_vector();
        match client.connect(state_vector).await {
            Ok(()) => {
                *shared.client.write().await = Some(client);
                shared.status_tx.send_modify(|s| {
                    s.connected = true;
                    s.connection_error = None;
                });
                if let Some(events) = events {
                    let handle = shared.spawn_event_loop(events);
                    shared.tasks().events = Some(handle);
                }
                let frame = shared.presence.lock().await.local_update();
                shared.send_presence(&frame).await;
            }
            Err(e) => {
                log::warn!(
                    "room {}: relay unreachable ({e}), continuing in local mode",
                    shared.room_id
                );
                shared.enter_local_mode(e.to_string()).await;
            }
        }

        shared.restart_election();
        shared.dedup_and_notify().await;
        Self { shared }
    }

    // ─── components ────────────────────────────────────────────────

    /// Insert a record, generating an id when it has none. Returns the id.
    pub async fn add_component(&self, mut record: ComponentRecord) -> String {
        record.ensure_id(&self.shared.identity.id);
        let pushed = self.shared.store.lock().await.push(&record);
        match pushed {
            Ok(update) => self.shared.send_update(update).await,
            Err(e) => log::warn!("add_component {}: {e}", record.id),
        }
        self.shared.dedup_and_notify().await;
        record.id
    }

    /// Merge `patch` into the record, or append it if the id is unknown.
    pub async fn update_component(&self, id: &str, patch: ComponentPatch) {
        let upserted = self.shared.store.lock().await.upsert(id, &patch);
        match upserted {
            Ok(update) => self.shared.send_update(update).await,
            Err(e) => log::warn!("update_component {id}: {e}"),
        }
        self.shared.dedup_and_notify().await;
    }

    pub async fn remove_component(&self, id: &str) {
        let removed = self.shared.store.lock().await.remove(id);
        if let Some(update) = removed {
            self.shared.send_update(update).await;
        }
        self.shared.dedup_and_notify().await;
    }

    pub async fn replace_all_components(&self, mut records: Vec<ComponentRecord>) {
        for record in &mut records {
            record.ensure_id(&self.shared.identity.id);
        }
        let replaced = self.shared.store.lock().await.replace_all(&records);
        match replaced {
            Ok(update) => self.shared.send_update(update).await,
            Err(e) => log::warn!("replace_all_components: {e}"),
        }
        self.shared.dedup_and_notify().await;
    }

    /// Current deduplicated component list.
    pub async fn components(&self) -> Vec<ComponentRecord> {
        self.shared.store.lock().await.load()
    }

    pub fn subscribe_components(&self) -> watch::Receiver<Vec<ComponentRecord>> {
        self.shared.components_tx.subscribe()
    }

    // ─── presence ──────────────────────────────────────────────────

    pub async fn update_cursor(&self, x: f64, y: f64) {
        let frame = self.shared.presence.lock().await.update_local_cursor(x, y);
        if let Some(frame) = frame {
            self.shared.send_presence(&frame).await;
        }
    }

    pub async fn update_selection(&self, component_ids: Vec<String>, viewport: Option<Viewport>) {
        let frame = self
            .shared
            .presence
            .lock()
            .await
            .update_local_selection(component_ids, viewport);
        self.shared.send_presence(&frame).await;
    }

    /// Show a chat bubble at our cursor for `chat_ttl`. A newer message
    /// replaces the bubble and restarts the timer.
    pub async fn send_chat_message(&self, message: impl Into<String>) -> Option<ChatMessage> {
        let message = message.into();
        if message.trim().is_empty() {
            return None;
        }

        let (frame, chat) = {
            let mut presence = self.shared.presence.lock().await;
            let local = presence.local_entry();
            let chat = ChatMessage {
                id: Uuid::new_v4().to_string(),
                message,
                user: local.user.clone()?,
                timestamp: now_millis(),
                position: local.cursor.unwrap_or_default(),
            };
            let frame = presence.update_local(|entry| entry.chat_message = Some(chat.clone()));
            (frame, chat)
        };

        self.shared.send_presence(&frame).await;
        self.shared.schedule_chat_clear(chat.id.clone());
        Some(chat)
    }

    /// Registered users in the room, oldest first.
    pub async fn list_active_users(&self) -> Vec<PresenceUser> {
        self.shared.presence.lock().await.active_users()
    }

    /// Presence entry of any session, ours included.
    pub async fn presence_of(&self, session_id: &Uuid) -> Option<PresenceEntry> {
        self.shared.presence.lock().await.entry(session_id).cloned()
    }

    // ─── status ────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status_tx.borrow().connected
    }

    pub fn connection_error(&self) -> Option<String> {
        self.shared.status_tx.borrow().connection_error.clone()
    }

    pub fn is_master(&self) -> bool {
        self.shared.status_tx.borrow().is_master
    }

    pub fn master_user_id(&self) -> Option<String> {
        self.shared.status_tx.borrow().master_user_id.clone()
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    /// Resign leadership, stop background work and leave the room.
    pub async fn close(&self) {
        {
            let mut tasks = self.shared.tasks();
            for task in [tasks.election.take(), tasks.chat_clear.take()]
                .into_iter()
                .flatten()
            {
                task.abort();
            }
        }

        self.shared.election.lock().await.resign();
        let frame = {
            let mut presence = self.shared.presence.lock().await;
            let local = presence.local_entry();
            let holds_claim = local.global_master_state.is_some() || local.cleanup_request.is_some();
            holds_claim.then(|| {
                presence.update_local(|entry| {
                    entry.global_master_state = None;
                    entry.cleanup_request = None;
                })
            })
        };
        if let Some(frame) = frame {
            self.shared.send_presence(&frame).await;
        }

        self.shared.tasks().abort_all();
        if let Some(mut client) = self.shared.client.write().await.take() {
            client.disconnect().await;
        }
        self.shared.status_tx.send_modify(|s| {
            s.connected = false;
            s.is_master = false;
            s.master_user_id = None;
        });
        log::info!("session {} closed", self.shared.session_id);
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        self.shared.tasks().abort_all();
    }
}

impl Shared {
    fn tasks(&self) -> StdMutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<SyncEvent>) -> JoinHandle<()> {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.handle_event(event).await;
            }
        })
    }

    async fn handle_event(self: &Arc<Self>, event: SyncEvent) {
        match event {
            SyncEvent::Connected => {}

            SyncEvent::SyncStep2(diff) => {
                let is_empty = {
                    let store = self.store.lock().await;
                    if let Err(e) = store.apply_update(&diff) {
                        log::warn!("room {}: bad sync diff: {e}", self.room_id);
                    }
                    store.is_empty()
                };
                if !self.synced.swap(true, Ordering::SeqCst) {
                    self.start_recovery(ConnectionState::Connected, is_empty);
                }
                self.dedup_and_notify().await;
            }

            SyncEvent::SyncStep1(state_vector) => {
                let diff = self.store.lock().await.encode_diff(&state_vector);
                match diff {
                    Ok(diff) => {
                        if let Some(client) = self.client.read().await.as_ref() {
                            if let Err(e) = client.send_sync_step2(diff).await {
                                log::warn!("room {}: sync reply failed: {e}", self.room_id);
                            }
                        }
                    }
                    Err(e) => log::warn!("room {}: bad state vector: {e}", self.room_id),
                }
            }

            SyncEvent::RemoteUpdate { session_id, update } => {
                let applied = self.store.lock().await.apply_update(&update);
                if let Err(e) = applied {
                    log::warn!("room {}: update from {session_id} rejected: {e}", self.room_id);
                    return;
                }
                self.dedup_and_notify().await;
            }

            SyncEvent::Presence(update) => self.on_remote_presence(update).await,

            SyncEvent::PeerJoined(info) => {
                log::debug!("room {}: {} joined", self.room_id, info.name);
            }

            SyncEvent::PeerLeft(session_id) => {
                let removed = self.presence.lock().await.remove_peer(&session_id);
                if removed.is_some() {
                    log::debug!("room {}: session {session_id} left", self.room_id);
                    self.restart_election();
                }
            }

            SyncEvent::Disconnected => {
                self.enter_local_mode("connection closed".to_string()).await;
                self.restart_election();
            }

            SyncEvent::Error(reason) => {
                self.enter_local_mode(reason).await;
                self.restart_election();
            }
        }
    }

    async fn on_remote_presence(self: &Arc<Self>, update: PresenceUpdate) {
        let requester = update
            .entry
            .cleanup_request
            .as_ref()
            .and(update.entry.user.clone());
        let Some(change) = self.presence.lock().await.apply_remote(update) else {
            return;
        };

        if let Some(requester) = requester {
            let holds_claim = self
                .presence
                .lock()
                .await
                .local_entry()
                .global_master_state
                .is_some();
            let cleared = self
                .election
                .lock()
                .await
                .handle_cleanup_request(&requester, holds_claim);
            if cleared {
                log::info!("room {}: dropping stale master claim", self.room_id);
                let frame = self.presence.lock().await.update_local(|entry| {
                    entry.global_master_state = None;
                    entry.cleanup_request = None;
                });
                self.send_presence(&frame).await;
                self.refresh_status().await;
            }
        }

        if change.is_membership() {
            self.restart_election();
        }
    }

    /// Transport is gone: keep editing locally, recover once if empty.
    async fn enter_local_mode(self: &Arc<Self>, reason: String) {
        self.status_tx.send_modify(|s| {
            s.connected = false;
            s.connection_error = Some(reason);
        });
        self.presence.lock().await.clear_remote();

        let is_empty = self.store.lock().await.is_empty();
        self.start_recovery(ConnectionState::Error, is_empty);
        self.dedup_and_notify().await;
    }

    /// Trip the recovery latch and, if this is the first run, fetch in the
    /// background. Mutations keep going while the fetch is in flight.
    fn start_recovery(self: &Arc<Self>, state: ConnectionState, is_empty: bool) {
        if self.recovery.begin(state, is_empty).is_err() {
            return;
        }
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move { shared.recover(state).await });
        self.tasks().recovery = Some(handle);
    }

    async fn recover(&self, state: ConnectionState) {
        let Ok(records) = self.recovery.fetch().await else {
            return;
        };

        let update = {
            let store = self.store.lock().await;
            let outcome = if state == ConnectionState::Connected {
                self.recovery.seed(records, SeedTarget::Replica(&store))
            } else {
                let apply = |records: Vec<ComponentRecord>| {
                    if let Err(e) = store.replace_all(&records) {
                        log::warn!("room {}: could not load snapshot locally: {e}", self.room_id);
                    }
                };
                self.recovery.seed(
                    records,
                    SeedTarget::Direct {
                        is_empty: store.is_empty(),
                        apply: &apply,
                    },
                )
            };
            match outcome {
                RecoveryOutcome::Seeded { update, .. } => update,
                _ => None,
            }
        };

        if let Some(update) = update {
            self.send_update(update).await;
        }
        self.dedup_and_notify().await;
    }

    /// Abort any running election round and start a fresh one.
    fn restart_election(self: &Arc<Self>) {
        let mut tasks = self.tasks();
        if let Some(previous) = tasks.election.take() {
            previous.abort();
        }
        let shared = Arc::clone(self);
        tasks.election = Some(tokio::spawn(async move {
            run_election(&shared.election, shared.as_ref(), &shared.config.election).await;
        }));
    }

    fn schedule_chat_clear(self: &Arc<Self>, chat_id: String) {
        let shared = Arc::clone(self);
        let ttl = self.config.chat_ttl;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let frame = {
                let mut presence = shared.presence.lock().await;
                let current = presence
                    .local_entry()
                    .chat_message
                    .as_ref()
                    .is_some_and(|chat| chat.id == chat_id);
                current.then(|| presence.update_local(|entry| entry.chat_message = None))
            };
            if let Some(frame) = frame {
                shared.send_presence(&frame).await;
            }
        });

        if let Some(previous) = self.tasks().chat_clear.replace(handle) {
            previous.abort();
        }
    }

    /// Rewrite away duplicate ids, then publish the list.
    async fn dedup_and_notify(&self) {
        let (records, rewrite) = {
            let store = self.store.lock().await;
            let rewrite = store.dedup();
            (store.load(), rewrite)
        };
        if let Some(update) = rewrite {
            log::debug!("room {}: removed duplicate components", self.room_id);
            self.send_update(update).await;
        }
        self.components_tx.send_replace(records);
    }

    async fn send_update(&self, update: Vec<u8>) {
        if let Some(client) = self.client.read().await.as_ref() {
            if let Err(e) = client.send_update(update).await {
                log::warn!("room {}: update not sent: {e}", self.room_id);
            }
        }
    }

    async fn send_presence(&self, frame: &PresenceUpdate) {
        if let Some(client) = self.client.read().await.as_ref() {
            if let Err(e) = client.send_presence(frame).await {
                log::warn!("room {}: presence not sent: {e}", self.room_id);
            }
        }
    }

    async fn refresh_status(&self) {
        let (is_master, master_user_id) = {
            let election = self.election.lock().await;
            (election.is_master(), election.master_user_id().map(str::to_owned))
        };
        self.status_tx.send_if_modified(|s| {
            if s.is_master == is_master && s.master_user_id == master_user_id {
                return false;
            }
            log::info!(
                "room {}: master is now {:?} (self: {is_master})",
                self.room_id,
                master_user_id
            );
            s.is_master = is_master;
            s.master_user_id = master_user_id.clone();
            true
        });
    }
}

#[async_trait]
impl ElectionHost for Shared {
    async fn presence_snapshot(&self) -> Vec<(Uuid, PresenceEntry)> {
        self.presence.lock().await.snapshot()
    }

    async fn publish(&self, decision: &Decision) {
        let frame = {
            let mut presence = self.presence.lock().await;
            let mut entry = presence.local_entry().clone();
            decision
                .apply_to(&mut entry)
                .then(|| presence.update_local(|local| *local = entry))
        };
        if let Some(frame) = frame {
            self.send_presence(&frame).await;
        }
        self.refresh_status().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot_source::{SnapshotError, StaticSnapshotSource};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Snapshot source that takes its time answering.
    struct SlowSnapshotSource {
        delay: Duration,
        snapshot: Value,
        fetches: AtomicUsize,
    }

    impl SlowSnapshotSource {
        fn new(delay: Duration, snapshot: Value) -> Self {
            Self {
                delay,
                snapshot,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SnapshotSource for SlowSnapshotSource {
        async fn fetch(&self, _room_id: &str) -> Result<Option<Value>, SnapshotError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(Some(self.snapshot.clone()))
        }
    }

    async fn unreachable_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}")
    }

    async fn local_session(source: Arc<dyn SnapshotSource>) -> CollabSession {
        let config = SessionConfig {
            server_url: unreachable_url().await,
            connect_timeout: Duration::from_millis(500),
            chat_ttl: Duration::from_millis(200),
            election: ElectionConfig {
                poll_interval: Duration::from_millis(10),
                ..ElectionConfig::default()
            },
            ..SessionConfig::default()
        };
        CollabSession::start(
            config,
            UserIdentity::new("u1", "Alice", "#ff0000"),
            "page-1",
            source,
        )
        .await
    }

    #[test]
    fn test_session_config_default() {
        let config = SessionConfig::default();
        assert_eq!(config.server_url, "ws://127.0.0.1:9090");
        assert_eq!(config.cursor_throttle, Duration::from_millis(33));
        assert_eq!(config.election.max_polls, 10);
    }

    #[tokio::test]
    async fn test_offline_add_is_visible_immediately() {
        let session = local_session(Arc::new(StaticSnapshotSource::new())).await;
        assert!(!session.is_connected());
        assert!(session.connection_error().is_some());

        let id = session
            .add_component(ComponentRecord::new("", "text").with_geometry(1.0, 2.0, 3.0, 4.0))
            .await;
        assert!(id.ends_with("-u1"));

        let components = session.components().await;
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].id, id);
        assert_eq!(session.subscribe_components().borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_local_mode_recovers_snapshot_directly() {
        let source = Arc::new(StaticSnapshotSource::new().with_snapshot(
            "page-1",
            json!({ "content": { "components": [{ "id": "saved", "type": "text" }] } }),
        ));
        let session = local_session(source.clone()).await;

        let mut components = session.subscribe_components();
        tokio::time::timeout(Duration::from_secs(5), components.wait_for(|list| list.len() == 1))
            .await
            .expect("snapshot never landed")
            .unwrap();
        assert_eq!(session.components().await[0].id, "saved");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_slow_snapshot_does_not_block_edits() {
        let source = Arc::new(SlowSnapshotSource::new(
            Duration::from_secs(1),
            json!({ "components": [{ "id": "saved", "type": "text" }] }),
        ));
        let session = local_session(source.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        session.add_component(ComponentRecord::new("mine", "text")).await;
        let ids: Vec<String> = session.components().await.into_iter().map(|r| r.id).collect();
        assert!(started.elapsed() < Duration::from_millis(500), "edit waited on the fetch");
        assert_eq!(ids, vec!["mine"]);

        // The fetch lands on a no longer empty store and is dropped.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let ids: Vec<String> = session.components().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["mine"]);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_update_remove_replace() {
        let session = local_session(Arc::new(StaticSnapshotSource::new())).await;
        session.add_component(ComponentRecord::new("a", "text")).await;
        session.add_component(ComponentRecord::new("b", "text")).await;

        session
            .update_component("a", ComponentPatch::position(10.0, 20.0))
            .await;
        let a = session.components().await.into_iter().find(|r| r.id == "a").unwrap();
        assert_eq!((a.x, a.y), (10.0, 20.0));

        session.remove_component("b").await;
        session.remove_component("missing").await;
        assert_eq!(session.components().await.len(), 1);

        session
            .replace_all_components(vec![
                ComponentRecord::new("x", "map"),
                ComponentRecord::new("", "button"),
            ])
            .await;
        let ids: Vec<String> = session.components().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], "x");
        assert!(!ids[1].is_empty());
    }

    #[tokio::test]
    async fn test_alone_in_local_mode_becomes_master() {
        let session = local_session(Arc::new(StaticSnapshotSource::new())).await;
        let mut status = session.subscribe_status();

        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_master))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.master_user_id().as_deref(), Some("u1"));
        assert_eq!(session.list_active_users().await.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_message_self_clears() {
        let session = local_session(Arc::new(StaticSnapshotSource::new())).await;
        session.update_cursor(5.0, 6.0).await;

        assert!(session.send_chat_message("   ").await.is_none());
        let first = session.send_chat_message("hello").await.unwrap();
        let second = session.send_chat_message("again").await.unwrap();
        assert_eq!(second.position.x, 5.0);
        assert_ne!(first.id, second.id);

        let own = session.session_id();
        let current = session.presence_of(&own).await.unwrap().chat_message.unwrap();
        assert_eq!(current.id, second.id);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(session.presence_of(&own).await.unwrap().chat_message.is_none());
    }

    #[tokio::test]
    async fn test_close_resigns() {
        let session = local_session(Arc::new(StaticSnapshotSource::new())).await;
        let mut status = session.subscribe_status();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_master))
            .await
            .unwrap()
            .unwrap();

        session.close().await;
        assert!(!session.is_master());
        let own = session.session_id();
        assert!(session.presence_of(&own).await.unwrap().global_master_state.is_none());
    }
}
