//! Wire protocol and WebSocket transport for collaboration.
//!
//! Messages are JSON text frames tagged by `type`. Storage updates travel
//! as base64 encoded Loro update blobs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::presence::{BroadcastEvent, Presence};

/// Messages sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room
    Join {
        room: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_key: Option<String>,
    },
    /// Leave current room
    Leave,
    /// Storage update (base64 encoded Loro bytes)
    Sync { data: String },
    /// Presence update (cursor, mode, selection)
    Presence { presence: Presence },
    /// One-shot event for the other peers
    Broadcast { event: BroadcastEvent },
}

/// Presence of another connection, as reported on join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub connection_id: String,
    pub presence: Presence,
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirm room join with current state
    Joined {
        room: String,
        connection_id: String,
        peer_count: usize,
        /// Snapshot of the room (if it has history)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial_sync: Option<String>,
        #[serde(default)]
        others: Vec<PeerPresence>,
    },
    /// Peer joined the room
    PeerJoined { peer_id: String },
    /// Peer left the room
    PeerLeft { peer_id: String },
    /// Storage update from another peer
    Sync { from: String, data: String },
    /// Presence update from another peer
    Presence { from: String, presence: Presence },
    /// One-shot event from another peer
    Broadcast { from: String, event: BroadcastEvent },
    /// Error message
    Error { message: String },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Raw events from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// A text frame from the server
    Message(String),
    Error(String),
}

/// What a handled server message meant for the client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Joined a room; the snapshot (if any) has been imported
    JoinedRoom {
        room: String,
        connection_id: String,
        peer_count: usize,
    },
    /// A peer joined the room
    PeerJoined { peer_id: String },
    /// A peer left the room
    PeerLeft { peer_id: String },
    /// Storage update applied; `changed` is false for duplicates
    StorageUpdated { from: String, changed: bool },
    /// Presence of a peer changed
    PresenceUpdated { from: String },
    /// A one-shot event arrived
    Broadcast { from: String, event: BroadcastEvent },
    /// Error reported by the server
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid WebSocket URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed message: {0}")]
    Message(#[from] serde_json::Error),
}

/// Encode update bytes for a `sync` message.
pub fn encode_payload(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode the bytes carried by a `sync` message.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, SyncError> {
    Ok(STANDARD.decode(data)?)
}

/// A bidirectional, polled message channel to the relay server.
pub trait Transport {
    /// Queue a text frame.
    fn send(&mut self, msg: &str) -> Result<(), SyncError>;

    /// Drain events received since the last poll (non-blocking).
    fn poll_events(&mut self) -> Vec<TransportEvent>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

mod native_client {
    use super::*;
    use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
    use std::thread::{self, JoinHandle};
    use std::time::Duration;
    use tungstenite::{connect, Message};
    use url::Url;

    /// Commands sent to the WebSocket thread.
    enum WsCommand {
        Send(String),
        Close,
    }

    /// WebSocket client for native platforms.
    ///
    /// Uses a background thread for non-blocking operation.
    pub struct NativeWebSocket {
        state: ConnectionState,
        events: Vec<TransportEvent>,
        /// Channel to send commands to the WebSocket thread.
        cmd_tx: Option<Sender<WsCommand>>,
        /// Channel to receive events from the WebSocket thread.
        event_rx: Option<Receiver<TransportEvent>>,
        _thread: Option<JoinHandle<()>>,
    }

    impl NativeWebSocket {
        /// Create a new disconnected WebSocket client.
        pub fn new() -> Self {
            Self {
                state: ConnectionState::Disconnected,
                events: Vec::new(),
                cmd_tx: None,
                event_rx: None,
                _thread: None,
            }
        }

        /// Connect to a WebSocket server. A handle whose socket thread has
        /// already exited is replaced.
        pub fn connect(&mut self, url: &str) -> Result<(), SyncError> {
            if self.cmd_tx.is_some() {
                let running = self._thread.as_ref().is_some_and(|h| !h.is_finished());
                if running {
                    return Err(SyncError::AlreadyConnected);
                }
                self.collect_events();
                self.release();
            }

            let parsed_url = Url::parse(url)?;
            if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
                return Err(SyncError::UnsupportedScheme(parsed_url.scheme().to_string()));
            }

            self.state = ConnectionState::Connecting;

            let (cmd_tx, cmd_rx) = channel::<WsCommand>();
            let (event_tx, event_rx) = channel::<TransportEvent>();
            let url = url.to_string();

            let handle = thread::spawn(move || run_socket(url, cmd_rx, event_tx));

            self.cmd_tx = Some(cmd_tx);
            self.event_rx = Some(event_rx);
            self._thread = Some(handle);

            Ok(())
        }

        /// Disconnect from the server.
        pub fn disconnect(&mut self) {
            if let Some(tx) = &self.cmd_tx {
                let _ = tx.send(WsCommand::Close);
            }
            self.release();
            self.state = ConnectionState::Disconnected;
        }

        fn release(&mut self) {
            self.cmd_tx = None;
            self.event_rx = None;
            self._thread = None;
        }

        /// Move thread events into the local queue and track the state.
        fn collect_events(&mut self) {
            let Some(rx) = &self.event_rx else {
                return;
            };
            let mut finished = false;
            while let Ok(event) = rx.try_recv() {
                match &event {
                    TransportEvent::Connected => self.state = ConnectionState::Connected,
                    TransportEvent::Disconnected => {
                        self.state = ConnectionState::Disconnected;
                        finished = true;
                    }
                    TransportEvent::Error(_) => {
                        self.state = ConnectionState::Error;
                        finished = true;
                    }
                    TransportEvent::Message(_) => {}
                }
                self.events.push(event);
            }
            // The socket thread exits after either event.
            if finished {
                self.release();
            }
        }
    }

    impl Transport for NativeWebSocket {
        fn send(&mut self, msg: &str) -> Result<(), SyncError> {
            match self.cmd_tx {
                Some(ref tx) => tx
                    .send(WsCommand::Send(msg.to_string()))
                    .map_err(|_| SyncError::ChannelClosed),
                None => Err(SyncError::NotConnected),
            }
        }

        fn poll_events(&mut self) -> Vec<TransportEvent> {
            self.collect_events();
            std::mem::take(&mut self.events)
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    fn run_socket(url: String, cmd_rx: Receiver<WsCommand>, event_tx: Sender<TransportEvent>) {
        log::info!("WebSocket thread: connecting to {}", url);

        let (mut socket, response) = match connect(&url) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("WebSocket connection failed: {}", e);
                let _ = event_tx.send(TransportEvent::Error(format!("Connection failed: {}", e)));
                return;
            }
        };

        log::info!("WebSocket connected, status: {}", response.status());
        let _ = event_tx.send(TransportEvent::Connected);

        // Short read timeout so the loop can interleave outgoing commands.
        match socket.get_mut() {
            tungstenite::stream::MaybeTlsStream::Plain(tcp) => {
                let _ = tcp.set_read_timeout(Some(Duration::from_millis(50)));
                let _ = tcp.set_write_timeout(Some(Duration::from_secs(5)));
            }
            #[allow(unreachable_patterns)]
            _ => {
                log::debug!("TLS or other stream - using default timeout handling");
            }
        }

        loop {
            let mut queued = 0;
            let drained = drain_commands(&cmd_rx, |msg| {
                log::debug!("WebSocket sending: {}", preview(&msg));
                queued += 1;
                match socket.write(Message::Text(msg)) {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("WebSocket send error: {}", e);
                        false
                    }
                }
            });
            if queued > 0 {
                if let Err(e) = socket.flush() {
                    log::error!("WebSocket flush error: {}", e);
                    break;
                }
            }
            match drained {
                Drained::Idle => {}
                Drained::Close => {
                    log::info!("WebSocket close requested");
                    let _ = socket.close(None);
                    break;
                }
                Drained::Stop => break,
            }

            match socket.read() {
                Ok(Message::Text(txt)) => {
                    log::debug!("WebSocket received: {}", preview(&txt));
                    if event_tx.send(TransportEvent::Message(txt)).is_err() {
                        break;
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = socket.send(Message::Pong(data));
                }
                Ok(Message::Close(_)) => {
                    log::info!("WebSocket received close frame");
                    break;
                }
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("WebSocket read error: {}", e);
                    break;
                }
            }
        }

        log::info!("WebSocket thread exiting");
        let _ = event_tx.send(TransportEvent::Disconnected);
    }

    /// Outcome of draining the command queue.
    #[derive(Debug, PartialEq)]
    enum Drained {
        /// Queue is empty; go back to reading.
        Idle,
        Close,
        /// A send failed or the client handle is gone.
        Stop,
    }

    /// Hand every queued message to `send` before the next blocking read.
    fn drain_commands(cmd_rx: &Receiver<WsCommand>, mut send: impl FnMut(String) -> bool) -> Drained {
        loop {
            match cmd_rx.try_recv() {
                Ok(WsCommand::Send(msg)) => {
                    if !send(msg) {
                        return Drained::Stop;
                    }
                }
                Ok(WsCommand::Close) => return Drained::Close,
                Err(TryRecvError::Empty) => return Drained::Idle,
                Err(TryRecvError::Disconnected) => {
                    log::info!("WebSocket command channel disconnected");
                    return Drained::Stop;
                }
            }
        }
    }

    fn preview(msg: &str) -> &str {
        let end = msg
            .char_indices()
            .nth(100)
            .map(|(i, _)| i)
            .unwrap_or(msg.len());
        &msg[..end]
    }

    impl Default for NativeWebSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for NativeWebSocket {
        fn drop(&mut self) {
            self.disconnect();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::net::TcpListener;
        use std::time::Instant;

        #[test]
        fn test_drain_sends_whole_backlog() {
            let (tx, rx) = channel();
            for i in 0..100 {
                tx.send(WsCommand::Send(format!("frame {}", i))).unwrap();
            }
            let mut sent = Vec::new();
            let drained = drain_commands(&rx, |msg| {
                sent.push(msg);
                true
            });
            assert_eq!(drained, Drained::Idle);
            assert_eq!(sent.len(), 100);
            assert_eq!(sent[99], "frame 99");

            tx.send(WsCommand::Send("last".to_string())).unwrap();
            tx.send(WsCommand::Close).unwrap();
            let mut sent = Vec::new();
            assert_eq!(
                drain_commands(&rx, |msg| {
                    sent.push(msg);
                    true
                }),
                Drained::Close
            );
            assert_eq!(sent, vec!["last".to_string()]);

            drop(tx);
            assert_eq!(drain_commands(&rx, |_| true), Drained::Stop);
        }

        #[test]
        fn test_drain_stops_on_send_failure() {
            let (tx, rx) = channel();
            tx.send(WsCommand::Send("a".to_string())).unwrap();
            tx.send(WsCommand::Send("b".to_string())).unwrap();
            assert_eq!(drain_commands(&rx, |_| false), Drained::Stop);
        }

        #[test]
        fn test_reconnect_after_failed_connect() {
            // Reserve a port, then close it so the connect is refused.
            let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
            let url = format!("ws://{}", addr);

            let mut ws = NativeWebSocket::new();
            ws.connect(&url).unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut events = Vec::new();
            while ws.state() != ConnectionState::Error {
                assert!(Instant::now() < deadline, "connect never failed");
                events.extend(ws.poll_events());
                thread::sleep(Duration::from_millis(10));
            }
            assert!(events.iter().any(|e| matches!(e, TransportEvent::Error(_))));

            assert!(ws.connect(&url).is_ok());
            ws.disconnect();
        }
    }
}

pub use native_client::NativeWebSocket;

/// Platform-specific WebSocket client type.
pub type PlatformWebSocket = NativeWebSocket;
