//! WebSocket sync client for the relay server.
//!
//! Provides:
//! - Connection lifecycle with a bounded connect timeout
//! - Join + state-vector handshake on connect
//! - Update, sync and presence sends (no-ops while offline)
//! - An event stream for the session layer
//!
//! Edits made offline are not queued: they stay in the local replica and
//! reach the relay through the state-vector handshake on the next connect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::PresenceUpdate;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Transport failure; the client is unusable until reconnected
    Error(String),
    /// Relay's state vector; answer with the diff it is missing
    SyncStep1(Vec<u8>),
    /// Relay's diff answering our state vector
    SyncStep2(Vec<u8>),
    RemoteUpdate { session_id: Uuid, update: Vec<u8> },
    Presence(PresenceUpdate),
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    room_id: String,
    server_url: String,
    connect_timeout: Duration,

    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<RwLock<u64>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(
        peer_info: PeerInfo,
        room_id: impl Into<String>,
        server_url: impl Into<String>,
        connect_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(event_capacity.max(1));
        Self {
            peer_info,
            room_id: room_id.into(),
            server_url: server_url.into(),
            connect_timeout,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the room and send our state vector.
    ///
    /// On failure the state becomes `Error` and an `Error` event is emitted.
    pub async fn connect(&mut self, state_vector: Vec<u8>) -> Result<(), ProtocolError> {
        self.shutdown_tasks();
        *self.state.write().await = ConnectionState::Connecting;

        let url = format!("{}/{}", self.server_url.trim_end_matches('/'), self.room_id);
        let connected =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await;

        let ws_stream = match connected {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => return Err(self.fail(ProtocolError::ConnectFailed(e.to_string())).await),
            Err(_) => return Err(self.fail(ProtocolError::Timeout).await),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        }));

        let join = SyncMessage::peer_joined(&self.room_id, &self.peer_info)?;
        let step1 = SyncMessage::sync_step1(self.peer_info.session_id, &self.room_id, state_vector);
        for msg in [join, step1] {
            out_tx
                .send(Message::Binary(msg.encode()?.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("Connected to {url} as {}", self.peer_info.session_id);

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let own_session = self.peer_info.session_id;
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(frame) => {
                                if let Some(event) = Self::event_for(frame, own_session) {
                                    if event_tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        log::warn!("Connection error: {e}");
                        *state.write().await = ConnectionState::Error;
                        let _ = event_tx.send(SyncEvent::Error(e.to_string())).await;
                        return;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        Ok(())
    }

    fn event_for(frame: SyncMessage, own_session: Uuid) -> Option<SyncEvent> {
        match frame.msg_type {
            MessageType::SyncStep1 => Some(SyncEvent::SyncStep1(frame.payload)),
            MessageType::SyncStep2 => Some(SyncEvent::SyncStep2(frame.payload)),
            MessageType::Update if frame.session_id != own_session => Some(SyncEvent::RemoteUpdate {
                session_id: frame.session_id,
                update: frame.payload,
            }),
            MessageType::Presence if frame.session_id != own_session => {
                match frame.presence_update() {
                    Ok(update) => Some(SyncEvent::Presence(update)),
                    Err(e) => {
                        log::warn!("Bad presence frame from {}: {e}", frame.session_id);
                        None
                    }
                }
            }
            MessageType::PeerJoined if frame.session_id != own_session => {
                frame.peer_info().ok().map(SyncEvent::PeerJoined)
            }
            MessageType::PeerLeft => Some(SyncEvent::PeerLeft(frame.session_id)),
            _ => None,
        }
    }

    async fn fail(&self, err: ProtocolError) -> ProtocolError {
        log::warn!("Connection to {} failed: {err}", self.server_url);
        *self.state.write().await = ConnectionState::Error;
        let _ = self.event_tx.send(SyncEvent::Error(err.to_string())).await;
        err
    }

    async fn send_frame(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            log::trace!("Offline, dropping {:?}", msg.msg_type);
            return Ok(());
        }
        let Some(tx) = &self.outgoing_tx else {
            return Ok(());
        };
        tx.send(Message::Binary(msg.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a CRDT update. No-op while offline.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        let clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };
        self.send_frame(SyncMessage::update(
            self.peer_info.session_id,
            &self.room_id,
            clock,
            update,
        ))
        .await
    }

    /// Answer the relay's state vector with the diff it lacks.
    pub async fn send_sync_step2(&self, diff: Vec<u8>) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::sync_step2(self.peer_info.session_id, &self.room_id, diff))
            .await
    }

    /// Publish our presence entry. No-op while offline.
    pub async fn send_presence(&self, update: &PresenceUpdate) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::presence(&self.room_id, update)?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::ping(self.peer_info.session_id)).await
    }

    /// Leave the room and close the socket.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            if let Ok(encoded) = SyncMessage::peer_left(self.peer_info.session_id, &self.room_id).encode() {
                let _ = tx.send(Message::Binary(encoded.into())).await;
            }
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        // Writer drains and closes on its own once the sender is dropped.
        if let Some(reader) = self.tasks.pop() {
            reader.abort();
        }
    }

    fn shutdown_tasks(&mut self) {
        self.outgoing_tx = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Number of updates sent so far.
    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tasks();
    }
}
