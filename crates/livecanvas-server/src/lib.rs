//! LiveCanvas WebSocket Relay Server
//!
//! Relays storage updates, presence and broadcast events between the
//! clients in a room, and keeps an authoritative Loro replica per room so
//! late joiners receive the full state.
//!
//! ## Protocol
//!
//! Messages are JSON text frames tagged by `type`:
//! ```json
//! { "type": "join", "room": "room-id", "public_key": "pk_..." }
//! { "type": "sync", "data": "<base64-encoded-loro-bytes>" }
//! { "type": "presence", "presence": { "cursor": { "x": 100, "y": 200 } } }
//! ```
//! Binary frames are treated as raw sync bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use clap::Parser;
use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use livecanvas_core::storage::{AutoSaveManager, FileStorage, Storage, StorageError};
use livecanvas_core::sync::{decode_payload, encode_payload, PeerPresence};
use livecanvas_core::{ClientMessage, Presence, ServerMessage};
use loro::{ExportMode, LoroDoc, VersionVector};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;
/// Sender id of snapshots pushed by the relay itself.
const SERVER_ID: &str = "server";

/// Relay server configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "livecanvas-server", version, about = "LiveCanvas collaboration relay")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "LIVECANVAS_ADDR", default_value = "0.0.0.0:3030")]
    pub addr: SocketAddr,

    /// Reject joins that do not present this key
    #[arg(long, env = "LIVECANVAS_PUBLIC_KEY")]
    pub public_key: Option<String>,

    /// Directory for room snapshots (enables persistence)
    #[arg(long, env = "LIVECANVAS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Persist rooms in the user data directory when no --data-dir is given
    #[arg(long)]
    pub persist: bool,

    /// Seconds between saves of a changed room
    #[arg(long, env = "LIVECANVAS_AUTOSAVE_SECS", default_value_t = 30)]
    pub autosave_secs: u64,
}

impl ServerConfig {
    /// Snapshot storage selected by the flags, if persistence is enabled.
    pub fn storage(&self) -> Result<Option<Arc<dyn Storage>>, StorageError> {
        let storage = match (&self.data_dir, self.persist) {
            (Some(dir), _) => FileStorage::new(dir.clone())?,
            (None, true) => FileStorage::default_location()?,
            (None, false) => return Ok(None),
        };
        info!("Persisting rooms in {}", storage.base_path().display());
        Ok(Some(Arc::new(storage)))
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_secs.max(1))
    }
}

/// Room state
struct Room {
    /// Broadcast channel for this room: (sender connection id, message)
    tx: broadcast::Sender<(String, ServerMessage)>,
    /// Connected peers and their last presence
    peers: HashMap<String, Presence>,
    /// Authoritative replica of the room storage
    doc: LoroDoc,
    /// Latest version known to be in storage
    saved: VersionVector,
}

impl Room {
    /// A room whose replica starts out matching storage.
    fn new(doc: LoroDoc) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let saved = doc.oplog_vv();
        Self {
            tx,
            peers: HashMap::new(),
            doc,
            saved,
        }
    }

    fn is_saved(&self) -> bool {
        self.doc.oplog_vv() == self.saved
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        match self.doc.export(ExportMode::Snapshot) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Failed to export room snapshot: {}", e);
                None
            }
        }
    }
}

/// What a joiner receives.
struct JoinInfo {
    rx: broadcast::Receiver<(String, ServerMessage)>,
    initial_sync: Option<String>,
    peer_count: usize,
    others: Vec<PeerPresence>,
}

/// Shared application state
pub struct AppState {
    /// Active rooms
    rooms: DashMap<String, Room>,
    /// Required join key, if any
    public_key: Option<String>,
    /// Snapshot persistence, if enabled
    autosave: Option<Mutex<AutoSaveManager<dyn Storage>>>,
    /// Serializes saves so a file never goes back to an older version
    save_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            public_key: None,
            autosave: None,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_public_key(mut self, key: Option<String>) -> Self {
        self.public_key = key;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>, interval: Duration) -> Self {
        self.autosave = Some(Mutex::new(AutoSaveManager::new(storage).with_interval(interval)));
        self
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self, StorageError> {
        let mut state = Self::new().with_public_key(config.public_key.clone());
        if let Some(storage) = config.storage()? {
            state = state.with_storage(storage, config.autosave_interval());
        }
        Ok(state)
    }

    /// Number of rooms currently in memory.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Connected peers in a room.
    pub fn peer_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.peers.len()).unwrap_or(0)
    }

    fn check_key(&self, key: Option<&str>) -> bool {
        match &self.public_key {
            Some(expected) => key == Some(expected.as_str()),
            None => true,
        }
    }

    fn storage(&self) -> Option<Arc<dyn Storage>> {
        let autosave = self.autosave.as_ref()?;
        let guard = autosave.lock().ok()?;
        Some(guard.storage().clone())
    }

    fn with_autosave(&self, f: impl FnOnce(&mut AutoSaveManager<dyn Storage>)) {
        if let Some(autosave) = &self.autosave {
            match autosave.lock() {
                Ok(mut guard) => f(&mut guard),
                Err(e) => warn!("Autosave state poisoned: {}", e),
            }
        }
    }

    /// Make sure the room is in memory, loading its snapshot on first use.
    async fn ensure_room(&self, room_id: &str) {
        if self.rooms.contains_key(room_id) {
            return;
        }
        let doc = LoroDoc::new();
        if let Some(storage) = self.storage() {
            match storage.load(room_id).await {
                Ok(bytes) => match doc.import(&bytes) {
                    Ok(_) => info!("Loaded room {} from storage", room_id),
                    Err(e) => warn!("Stored snapshot for {} is unreadable: {}", room_id, e),
                },
                Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!("Failed to load room {}: {}", room_id, e),
            }
        }
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(doc));
    }

    /// Add peer to room
    fn join_room(&self, room_id: &str, peer_id: &str) -> JoinInfo {
        let mut room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Room::new(LoroDoc::new()));
        let others = room
            .peers
            .iter()
            .map(|(id, presence)| PeerPresence {
                connection_id: id.clone(),
                presence: presence.clone(),
            })
            .collect();
        room.peers.insert(peer_id.to_string(), Presence::default());
        let initial_sync = if room.doc.len_ops() > 0 {
            room.snapshot().map(|bytes| encode_payload(&bytes))
        } else {
            None
        };
        JoinInfo {
            rx: room.tx.subscribe(),
            initial_sync,
            peer_count: room.peers.len(),
            others,
        }
    }

    /// Remove peer from room. Returns true when the room is left empty
    /// with changes that still have to be saved before it can be dropped.
    fn leave_room(&self, room_id: &str, peer_id: &str) -> bool {
        let Some(mut room) = self.rooms.get_mut(room_id) else {
            return false;
        };
        room.peers.remove(peer_id);
        if !room.peers.is_empty() {
            return false;
        }
        drop(room);
        !self.drop_if_idle(room_id) && self.rooms.contains_key(room_id)
    }

    /// Drop a room that has no peers and nothing left to save.
    fn drop_if_idle(&self, room_id: &str) -> bool {
        let persisted = self.autosave.is_some();
        let removed = self
            .rooms
            .remove_if(room_id, |_, room| {
                room.peers.is_empty() && (!persisted || room.is_saved())
            })
            .is_some();
        if removed {
            info!("Room {} is empty, dropping it", room_id);
            self.with_autosave(|autosave| autosave.forget(room_id));
        }
        removed
    }

    /// Import a sync payload into the room replica.
    fn apply_sync(&self, room_id: &str, bytes: &[u8]) -> Result<(), String> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| format!("room {} does not exist", room_id))?;
        room.doc
            .import(bytes)
            .map_err(|e| format!("Invalid sync data: {}", e))?;
        drop(room);
        self.with_autosave(|autosave| autosave.mark_dirty(room_id));
        Ok(())
    }

    fn update_presence(&self, room_id: &str, peer_id: &str, presence: Presence) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            if let Some(slot) = room.peers.get_mut(peer_id) {
                *slot = presence;
            }
        }
    }

    /// Broadcast message to room
    fn broadcast(&self, room_id: &str, from: &str, msg: ServerMessage) {
        if let Some(room) = self.rooms.get(room_id) {
            let _ = room.tx.send((from.to_string(), msg));
        }
    }

    /// Write the current replica of a room to storage, then drop the room
    /// if it is idle. Returns true if a snapshot was written.
    async fn save_snapshot(&self, room_id: &str) -> bool {
        let Some(storage) = self.storage() else {
            return false;
        };
        let _guard = self.save_lock.lock().await;

        // Clear the flag first so edits accepted during the write stay dirty.
        self.with_autosave(|autosave| {
            autosave.take_dirty(room_id);
        });
        let exported = self.rooms.get(room_id).and_then(|room| {
            let version = room.doc.oplog_vv();
            room.snapshot().map(|bytes| (bytes, version))
        });
        let Some((snapshot, version)) = exported else {
            return false;
        };

        match storage.save(room_id, &snapshot).await {
            Ok(()) => {
                debug!("Saved room {} ({} bytes)", room_id, snapshot.len());
                self.with_autosave(|autosave| autosave.record_saved(room_id, Instant::now()));
                if let Some(mut room) = self.rooms.get_mut(room_id) {
                    room.saved = version;
                }
                self.drop_if_idle(room_id);
                true
            }
            Err(e) => {
                warn!("Failed to save room {}: {}", room_id, e);
                self.with_autosave(|autosave| autosave.mark_dirty(room_id));
                false
            }
        }
    }

    /// Save every dirty room whose autosave interval has elapsed.
    pub async fn save_due(&self) -> usize {
        let mut due = Vec::new();
        self.with_autosave(|autosave| due = autosave.due(Instant::now()));
        self.save_rooms(due).await
    }

    /// Save every dirty room now.
    pub async fn save_all(&self) -> usize {
        let dirty: Vec<String> = self
            .rooms
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut rooms = Vec::new();
        self.with_autosave(|autosave| {
            rooms = dirty.into_iter().filter(|r| autosave.is_dirty(r)).collect();
        });
        self.save_rooms(rooms).await
    }

    async fn save_rooms(&self, rooms: Vec<String>) -> usize {
        let mut saved = 0;
        for room_id in rooms {
            if self.save_snapshot(&room_id).await {
                saved += 1;
            }
        }
        saved
    }

    /// The room replica as a sync message, for peers that fell behind.
    fn resync_message(&self, room_id: &str) -> Option<ServerMessage> {
        let room = self.rooms.get(room_id)?;
        let snapshot = room.snapshot()?;
        Some(ServerMessage::Sync {
            from: SERVER_ID.to_string(),
            data: encode_payload(&snapshot),
        })
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically save changed rooms.
pub fn spawn_autosave(state: Arc<AppState>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let saved = state.save_due().await;
            if saved > 0 {
                info!("Autosaved {} room(s)", saved);
            }
        }
    })
}

/// Index page
async fn index() -> &'static str {
    "LiveCanvas Relay Server - Connect via WebSocket at /ws"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type Sender = SplitSink<WebSocket, Message>;

/// Send a message to this client. Returns false if the socket is gone.
async fn send_json(sender: &mut Sender, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode message: {}", e);
            true
        }
    }
}

async fn send_error(sender: &mut Sender, message: String) -> bool {
    send_json(sender, &ServerMessage::Error { message }).await
}

/// Per-connection state
struct Connection {
    peer_id: String,
    room: Option<String>,
    room_rx: Option<broadcast::Receiver<(String, ServerMessage)>>,
}

impl Connection {
    async fn leave(&mut self, state: &AppState) {
        self.room_rx = None;
        let Some(room) = self.room.take() else {
            return;
        };
        state.broadcast(
            &room,
            &self.peer_id,
            ServerMessage::PeerLeft {
                peer_id: self.peer_id.clone(),
            },
        );
        if state.leave_room(&room, &self.peer_id) {
            state.save_snapshot(&room).await;
        }
        info!("Peer {} left room {}", self.peer_id, room);
    }

    /// Import and relay a sync payload. Bad payloads are answered with an
    /// error and not relayed.
    async fn sync(&mut self, state: &AppState, sender: &mut Sender, bytes: &[u8]) -> bool {
        let Some(room) = self.room.clone() else {
            return send_error(sender, "Join a room before syncing".to_string()).await;
        };
        if let Err(message) = state.apply_sync(&room, bytes) {
            warn!("Rejected sync from {}: {}", self.peer_id, message);
            return send_error(sender, message).await;
        }
        debug!("Relaying {} bytes from {} in {}", bytes.len(), self.peer_id, room);
        state.broadcast(
            &room,
            &self.peer_id,
            ServerMessage::Sync {
                from: self.peer_id.clone(),
                data: encode_payload(bytes),
            },
        );
        true
    }

    /// What to forward to this client for a message from the room channel.
    fn relayed(
        &mut self,
        state: &AppState,
        relayed: Result<(String, ServerMessage), broadcast::error::RecvError>,
    ) -> Option<ServerMessage> {
        match relayed {
            // Don't echo back to sender
            Ok((from, msg)) if from != self.peer_id => Some(msg),
            Ok(_) => None,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Dropped updates cannot be replayed; send the whole replica.
                warn!("Peer {} lagged, {} messages dropped; resyncing", self.peer_id, skipped);
                state.resync_message(self.room.as_deref()?)
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.room_rx = None;
                None
            }
        }
    }

    /// Handle one client message. Returns false if the socket is gone.
    async fn handle(&mut self, state: &AppState, sender: &mut Sender, msg: ClientMessage) -> bool {
        match msg {
            ClientMessage::Join { room, public_key } => {
                if !state.check_key(public_key.as_deref()) {
                    warn!("Peer {} presented a bad public key", self.peer_id);
                    return send_error(sender, "Invalid public key".to_string()).await;
                }

                // Leave current room if any
                self.leave(state).await;

                state.ensure_room(&room).await;
                let join = state.join_room(&room, &self.peer_id);
                self.room_rx = Some(join.rx);
                self.room = Some(room.clone());

                let joined = ServerMessage::Joined {
                    room: room.clone(),
                    connection_id: self.peer_id.clone(),
                    peer_count: join.peer_count,
                    initial_sync: join.initial_sync,
                    others: join.others,
                };
                if !send_json(sender, &joined).await {
                    return false;
                }

                // Notify others
                state.broadcast(
                    &room,
                    &self.peer_id,
                    ServerMessage::PeerJoined {
                        peer_id: self.peer_id.clone(),
                    },
                );
                info!("Peer {} joined room {}", self.peer_id, room);
                true
            }
            ClientMessage::Leave => {
                self.leave(state).await;
                true
            }
            ClientMessage::Sync { data } => match decode_payload(&data) {
                Ok(bytes) => self.sync(state, sender, &bytes).await,
                Err(e) => send_error(sender, format!("Invalid sync data: {}", e)).await,
            },
            ClientMessage::Presence { presence } => {
                if let Some(room) = &self.room {
                    state.update_presence(room, &self.peer_id, presence.clone());
                    state.broadcast(
                        room,
                        &self.peer_id,
                        ServerMessage::Presence {
                            from: self.peer_id.clone(),
                            presence,
                        },
                    );
                }
                true
            }
            ClientMessage::Broadcast { event } => {
                if let Some(room) = &self.room {
                    state.broadcast(
                        room,
                        &self.peer_id,
                        ServerMessage::Broadcast {
                            from: self.peer_id.clone(),
                            event,
                        },
                    );
                }
                true
            }
        }
    }
}

/// Next message from the joined room, or never if not in a room.
async fn next_relay(
    rx: &mut Option<broadcast::Receiver<(String, ServerMessage)>>,
) -> Result<(String, ServerMessage), broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut conn = Connection {
        peer_id: Uuid::new_v4().to_string(),
        room: None,
        room_rx: None,
    };
    info!("New connection: {}", conn.peer_id);

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // Handle incoming messages from client
            msg = receiver.next() => {
                let alive = match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => conn.handle(&state, &mut sender, client_msg).await,
                            Err(e) => {
                                warn!("Invalid message from {}: {}", conn.peer_id, e);
                                send_error(&mut sender, format!("Invalid message: {}", e)).await
                            }
                        }
                    }
                    // Binary messages are treated as raw sync data
                    Some(Ok(Message::Binary(data))) => conn.sync(&state, &mut sender, &data).await,
                    Some(Ok(Message::Close(_))) | None => false,
                    Some(Ok(_)) => true,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", conn.peer_id, e);
                        false
                    }
                };
                if !alive {
                    break;
                }
            }

            // Handle broadcast messages from room
            relayed = next_relay(&mut conn.room_rx) => {
                if let Some(server_msg) = conn.relayed(&state, relayed) {
                    if !send_json(&mut sender, &server_msg).await {
                        break;
                    }
                }
            }
        }
    }

    // Cleanup on disconnect
    conn.leave(&state).await;
    info!("Connection closed: {}", conn.peer_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::Point;
    use livecanvas_core::shapes::{Rectangle, Shape};
    use livecanvas_core::storage::MemoryStorage;
    use livecanvas_core::{ShapeRecord, SharedStorage};

    fn snapshot_with_shape() -> (Vec<u8>, Shape) {
        let mut storage = SharedStorage::new();
        let shape = Shape::Rectangle(Rectangle::new(Point::ZERO, 10.0, 10.0));
        storage.upsert_shape(&ShapeRecord::new(shape.clone(), 0.0)).unwrap();
        (storage.export_snapshot().unwrap(), shape)
    }

    #[test]
    fn test_config_defaults() {
        let config = ServerConfig::parse_from(["livecanvas-server"]);
        assert_eq!(config.addr, "0.0.0.0:3030".parse::<SocketAddr>().unwrap());
        assert_eq!(config.autosave_secs, 30);
        assert!(config.storage().unwrap().is_none());
    }

    #[test]
    fn test_config_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::parse_from([
            "livecanvas-server",
            "--addr",
            "127.0.0.1:9000",
            "--public-key",
            "pk",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "--autosave-secs",
            "5",
        ]);
        assert_eq!(config.public_key.as_deref(), Some("pk"));
        assert_eq!(config.autosave_interval(), Duration::from_secs(5));
        assert!(config.storage().unwrap().is_some());
    }

    #[test]
    fn test_public_key_check() {
        let open = AppState::new();
        assert!(open.check_key(None));
        let locked = AppState::new().with_public_key(Some("pk".to_string()));
        assert!(locked.check_key(Some("pk")));
        assert!(!locked.check_key(Some("nope")));
        assert!(!locked.check_key(None));
    }

    #[tokio::test]
    async fn test_join_reports_snapshot_and_others() {
        let state = AppState::new();
        let first = state.join_room("room", "a");
        assert_eq!(first.peer_count, 1);
        assert!(first.initial_sync.is_none());
        assert!(first.others.is_empty());

        let (bytes, _) = snapshot_with_shape();
        state.apply_sync("room", &bytes).unwrap();

        let second = state.join_room("room", "b");
        assert_eq!(second.peer_count, 2);
        assert!(second.initial_sync.is_some());
        assert_eq!(second.others.len(), 1);
        assert_eq!(second.others[0].connection_id, "a");
    }

    #[tokio::test]
    async fn test_bad_sync_is_rejected() {
        let state = AppState::new();
        state.join_room("room", "a");
        assert!(state.apply_sync("room", b"not loro").is_err());
        assert!(state.apply_sync("missing", b"").is_err());
    }

    #[tokio::test]
    async fn test_room_dropped_when_empty() {
        let state = AppState::new();
        state.join_room("room", "a");
        state.join_room("room", "b");
        assert!(!state.leave_room("room", "a"));
        assert_eq!(state.peer_count("room"), 1);
        assert!(!state.leave_room("room", "b"));
        assert_eq!(state.room_count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = AppState::new().with_storage(storage.clone(), Duration::from_secs(30));

        state.ensure_room("room").await;
        state.join_room("room", "a");
        let (bytes, shape) = snapshot_with_shape();
        state.apply_sync("room", &bytes).unwrap();
        assert_eq!(state.save_due().await, 1);
        assert_eq!(state.save_due().await, 0);

        // Nothing changed since the save, so the last leave drops the room.
        assert!(!state.leave_room("room", "a"));
        assert_eq!(state.room_count(), 0);
        assert!(storage.exists("room").await.unwrap());

        let restored = AppState::new().with_storage(storage, Duration::from_secs(30));
        restored.ensure_room("room").await;
        let join = restored.join_room("room", "b");
        let data = decode_payload(&join.initial_sync.unwrap()).unwrap();
        let replica = SharedStorage::from_snapshot(&data).unwrap();
        assert_eq!(replica.get_shape(shape.id()).unwrap().shape, shape);
    }

    #[tokio::test]
    async fn test_last_leave_saves_before_dropping() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = AppState::new().with_storage(storage.clone(), Duration::from_secs(30));
        state.join_room("room", "a");
        let (bytes, _) = snapshot_with_shape();
        state.apply_sync("room", &bytes).unwrap();

        assert!(state.leave_room("room", "a"));
        assert_eq!(state.room_count(), 1);
        assert!(state.save_snapshot("room").await);
        assert_eq!(state.room_count(), 0);
        assert!(storage.exists("room").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejoin_while_saving_keeps_live_room() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = AppState::new().with_storage(storage.clone(), Duration::from_secs(30));
        state.join_room("room", "a");
        let (bytes, shape) = snapshot_with_shape();
        state.apply_sync("room", &bytes).unwrap();
        assert!(state.leave_room("room", "a"));

        // A join lands before the final save finishes.
        state.ensure_room("room").await;
        let join = state.join_room("room", "b");
        let data = decode_payload(&join.initial_sync.unwrap()).unwrap();
        let replica = SharedStorage::from_snapshot(&data).unwrap();
        assert_eq!(replica.get_shape(shape.id()).unwrap().shape, shape);

        assert!(state.save_snapshot("room").await);
        assert_eq!(state.room_count(), 1);
        assert_eq!(state.peer_count("room"), 1);
    }

    #[tokio::test]
    async fn test_sync_during_save_stays_dirty() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let state = AppState::new().with_storage(storage, Duration::from_secs(30));
        state.join_room("room", "a");
        let (first, _) = snapshot_with_shape();
        state.apply_sync("room", &first).unwrap();

        // The flag is cleared before export, so a later accept re-marks it.
        state.with_autosave(|autosave| {
            autosave.take_dirty("room");
        });
        let (second, _) = snapshot_with_shape();
        state.apply_sync("room", &second).unwrap();
        let mut dirty = false;
        state.with_autosave(|autosave| dirty = autosave.is_dirty("room"));
        assert!(dirty);

        assert!(state.save_snapshot("room").await);
        state.with_autosave(|autosave| dirty = autosave.is_dirty("room"));
        assert!(!dirty);
    }

    #[tokio::test]
    async fn test_lagged_peer_gets_full_replica() {
        let state = AppState::new();
        let join = state.join_room("room", "a");
        let mut rx = join.rx;
        let (bytes, shape) = snapshot_with_shape();
        state.apply_sync("room", &bytes).unwrap();
        for _ in 0..=CHANNEL_CAPACITY {
            state.broadcast(
                "room",
                "b",
                ServerMessage::PeerJoined {
                    peer_id: "b".to_string(),
                },
            );
        }

        let mut conn = Connection {
            peer_id: "a".to_string(),
            room: Some("room".to_string()),
            room_rx: None,
        };
        let relayed = rx.recv().await;
        assert!(matches!(relayed, Err(broadcast::error::RecvError::Lagged(_))));
        let Some(ServerMessage::Sync { from, data }) = conn.relayed(&state, relayed) else {
            panic!("expected a resync");
        };
        assert_eq!(from, SERVER_ID);
        let replica = SharedStorage::from_snapshot(&decode_payload(&data).unwrap()).unwrap();
        assert_eq!(replica.get_shape(shape.id()).unwrap().shape, shape);

        // Own messages are not echoed.
        let own = Ok(("a".to_string(), ServerMessage::PeerLeft { peer_id: "a".to_string() }));
        assert!(conn.relayed(&state, own).is_none());
    }
}
