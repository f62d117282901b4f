//! WebSocket relay server with room-based page routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (room_id) ── ComponentStore (relay replica)
//! Client B ──┘          │
//!                       └── BroadcastGroup ── peers + last presence
//!                                 │
//!                      ┌──────────┼───────────┐
//!                      ▼          ▼           ▼
//!                   Client A   Client B    Client C
//! ```
//!
//! The relay merges every update into its own replica so late joiners can
//! catch up through the SyncStep1/SyncStep2 handshake. Rooms live only as
//! long as they have peers; nothing is persisted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{Room, RoomManager};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room; further joins are refused
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// WebSocket ping interval in seconds (0 disables)
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

/// Per-connection state once the peer has joined a room.
struct Joined {
    session_id: Uuid,
    room_id: String,
    room: Arc<Room>,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat_interval_secs;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, heartbeat).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<ServerStats>>,
        heartbeat_secs: u64,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut heartbeat = (heartbeat_secs > 0).then(|| {
            let period = Duration::from_secs(heartbeat_secs);
            tokio::time::interval_at(tokio::time::Instant::now() + period, period)
        });
        let mut joined: Option<Joined> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let keep_open = Self::handle_frame(
                                    bytes, addr, &rooms, &stats, &mut joined, &mut ws_sender,
                                ).await?;
                                if !keep_open {
                                    break;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    msg = async {
                        match joined.as_mut() {
                            Some(j) => j.rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                let own = joined.as_ref().map(|j| j.session_id);
                                if let Ok(frame) = SyncMessage::decode(&data) {
                                    if Some(frame.session_id) == own {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer at {addr} lagged by {n} messages");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }

                    _ = async {
                        match heartbeat.as_mut() {
                            Some(interval) => { interval.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(j) = joined {
            rooms.leave(&j.room_id, &j.session_id).await;
            log::info!("Session {} left room {}", j.session_id, j.room_id);
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }

        result
    }

    /// Handle one decoded client frame. Returns false to close the connection.
    async fn handle_frame(
        bytes: Vec<u8>,
        addr: SocketAddr,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        joined: &mut Option<Joined>,
        ws_sender: &mut WsSink,
    ) -> Result<bool, BoxError> {
        let msg = match SyncMessage::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode message from {addr}: {e}");
                return Ok(true);
            }
        };

        if msg.msg_type == MessageType::PeerJoined {
            if joined.is_some() {
                log::debug!("Ignoring repeated join from {addr}");
                return Ok(true);
            }
            return Self::join(msg, rooms, stats, joined, ws_sender).await;
        }

        let Some(j) = joined.as_ref() else {
            log::debug!("Dropping {:?} from {addr} before join", msg.msg_type);
            return Ok(true);
        };

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let (diff, state_vector) = {
                    let replica = j.room.replica.lock().await;
                    let diff = match replica.encode_diff(&msg.payload) {
                        Ok(diff) => diff,
                        Err(e) => {
                            log::warn!("Bad state vector from {}: {e}", j.session_id);
                            return Ok(true);
                        }
                    };
                    (diff, replica.state_vector())
                };
                send(ws_sender, &SyncMessage::sync_step2(Uuid::nil(), &j.room_id, diff)).await?;
                send(
                    ws_sender,
                    &SyncMessage::sync_step1(Uuid::nil(), &j.room_id, state_vector),
                )
                .await?;
            }

            MessageType::SyncStep2 | MessageType::Update => {
                let applied = j.room.replica.lock().await.apply_update(&msg.payload);
                match applied {
                    Ok(()) => {
                        let relay =
                            SyncMessage::update(j.session_id, &j.room_id, msg.clock, msg.payload);
                        j.room.group.broadcast(&relay)?;
                    }
                    Err(e) => log::warn!("Rejected update from {}: {e}", j.session_id),
                }
            }

            MessageType::Presence => {
                if msg.session_id != j.session_id {
                    log::warn!("Presence for foreign session from {addr} dropped");
                    return Ok(true);
                }
                let frame = Arc::new(bytes);
                j.room.group.record_presence(&j.session_id, frame.clone()).await;
                j.room.group.broadcast_raw(frame);
                log::trace!("Presence from {} in room {}", j.session_id, j.room_id);
            }

            MessageType::Ping => {
                send(ws_sender, &SyncMessage::pong(j.session_id)).await?;
            }

            MessageType::PeerLeft => return Ok(false),

            other => log::debug!("Unhandled message type: {other:?}"),
        }
        Ok(true)
    }

    async fn join(
        msg: SyncMessage,
        rooms: &RoomManager,
        stats: &RwLock<ServerStats>,
        joined: &mut Option<Joined>,
        ws_sender: &mut WsSink,
    ) -> Result<bool, BoxError> {
        let mut info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_session(msg.session_id, "", "Anonymous"));
        info.session_id = msg.session_id;
        let room_id = msg.room_id;

        let (room, rx) = match rooms.join(&room_id, info.clone()).await {
            Ok(joined_room) => joined_room,
            Err(full) => {
                log::warn!("Refusing {} ({}): {full}", info.name, info.session_id);
                stats.write().await.rejected_joins += 1;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(false);
            }
        };

        for frame in room.group.presence_frames_except(&info.session_id).await {
            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
        }
        room.group.broadcast(&SyncMessage::peer_joined(&room_id, &info)?)?;
        stats.write().await.active_rooms = rooms.room_count().await;

        log::info!("Peer {} ({}) joined room {room_id}", info.name, info.session_id);
        *joined = Some(Joined {
            session_id: info.session_id,
            room_id,
            room,
            rx,
        });
        Ok(true)
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn send(ws_sender: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
    ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}
