//! Ephemeral presence: cursors, cursor modes, and reactions.
//!
//! Presence is relayed between peers but never written to the shared map.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::shapes::ShapeId;

/// Reactions fade out after this long.
pub const REACTION_LIFETIME: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl From<kurbo::Point> for CursorPosition {
    fn from(p: kurbo::Point) -> Self {
        Self { x: p.x, y: p.y }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

/// What a cursor is currently showing besides its position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CursorMode {
    #[default]
    Hidden,
    /// Live chat bubble next to the cursor.
    Chat {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_message: Option<String>,
    },
    /// The emoji picker is open.
    ReactionSelector,
    /// A reaction emoji follows the cursor; while pressed it keeps emitting.
    Reaction { reaction: String, is_pressed: bool },
}

/// Presence state for one connection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Presence {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub mode: CursorMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<ShapeId>,
}

/// A reaction burst at a canvas position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub x: f64,
    pub y: f64,
    pub value: String,
}

/// One-shot events relayed to every other peer without persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BroadcastEvent {
    Reaction(ReactionEvent),
}

/// Presence of the other connections in the room, keyed by connection id.
#[derive(Debug, Default)]
pub struct PresenceRoster {
    peers: HashMap<String, Presence>,
}

impl PresenceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update or add a connection's presence.
    pub fn update(&mut self, connection_id: impl Into<String>, presence: Presence) {
        self.peers.insert(connection_id.into(), presence);
    }

    pub fn remove(&mut self, connection_id: &str) -> Option<Presence> {
        self.peers.remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<&Presence> {
        self.peers.get(connection_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Presence)> {
        self.peers.iter()
    }

    /// Connections whose cursor is on the canvas.
    pub fn visible_cursors(&self) -> impl Iterator<Item = (&String, CursorPosition)> {
        self.peers
            .iter()
            .filter_map(|(id, p)| p.cursor.map(|c| (id, c)))
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

/// Recent reactions, kept until they fade out.
#[derive(Debug, Default)]
pub struct ReactionLog {
    entries: Vec<(ReactionEvent, Instant)>,
}

impl ReactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reaction: ReactionEvent, now: Instant) {
        self.prune(now);
        self.entries.push((reaction, now));
    }

    /// Drop reactions older than [`REACTION_LIFETIME`].
    pub fn prune(&mut self, now: Instant) {
        self.entries
            .retain(|(_, at)| now.saturating_duration_since(*at) < REACTION_LIFETIME);
    }

    /// Reactions still visible at `now`, oldest first.
    pub fn active(&self, now: Instant) -> impl Iterator<Item = &ReactionEvent> {
        self.entries
            .iter()
            .filter(move |(_, at)| now.saturating_duration_since(*at) < REACTION_LIFETIME)
            .map(|(r, _)| r)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
