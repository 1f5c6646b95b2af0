//! Collaboration management for real-time multi-user editing.
//!
//! [`SyncAdapter`] sits between the local canvas and the shared storage. It
//! writes local edits into storage, turns storage changes into outgoing
//! `sync` messages, and applies incoming server messages. The canvas is a
//! disposable projection: [`SyncAdapter::render_canvas`] rebuilds it from
//! storage whenever [`SyncAdapter::take_storage_changed`] reports a change.

use std::time::Instant;

use kurbo::Point;
use loro::{LoroDoc, VersionVector};

use crate::canvas::{Canvas, CanvasEdit};
use crate::comments::{next_z_index, sort_threads, Comment, CommentError, CommentThread, ThreadId};
use crate::crdt::{CrdtError, ShapeRecord, SharedStorage};
use crate::presence::{
    BroadcastEvent, CursorMode, CursorPosition, Presence, PresenceRoster, ReactionEvent, ReactionLog,
    UserInfo,
};
use crate::shapes::{Shape, ShapeId};
use crate::sync::{decode_payload, encode_payload, ClientMessage, ServerMessage, SyncEvent};
use crate::throttle::Throttle;

/// Keeps the shared storage, the room connection state, and presence in step.
pub struct SyncAdapter {
    storage: SharedStorage,
    /// Current room ID (set when the server confirms the join).
    current_room: Option<String>,
    /// Connection id the server assigned to us.
    connection_id: Option<String>,
    public_key: Option<String>,
    /// Storage version already sent to the room.
    last_sent: VersionVector,
    /// Pending outgoing messages (JSON strings).
    outgoing: Vec<String>,
    storage_changed: bool,
    presence: Presence,
    cursor_throttle: Throttle,
    /// A cursor move was held back by the throttle.
    cursor_pending: bool,
    roster: PresenceRoster,
    reactions: ReactionLog,
}

impl SyncAdapter {
    pub fn new() -> Self {
        Self::from_storage(SharedStorage::new())
    }

    /// Create from existing storage (e.g., loaded from disk).
    pub fn from_storage(storage: SharedStorage) -> Self {
        Self {
            storage,
            current_room: None,
            connection_id: None,
            public_key: None,
            last_sent: VersionVector::default(),
            outgoing: Vec::new(),
            storage_changed: true,
            presence: Presence::default(),
            cursor_throttle: Throttle::default(),
            cursor_pending: false,
            roster: PresenceRoster::new(),
            reactions: ReactionLog::new(),
        }
    }

    /// Key sent with every join request.
    pub fn with_public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    pub fn peer_id(&self) -> u64 {
        self.storage.peer_id()
    }

    // --- Shape writes ---

    /// Write a shape into storage, keeping its z key if it already exists.
    pub fn sync_shape_in_storage(&mut self, shape: &Shape) -> Result<(), CrdtError> {
        let z = match self.storage.get_shape(shape.id()) {
            Some(existing) => existing.z,
            None => self.storage.next_z(),
        };
        self.storage.upsert_shape(&ShapeRecord::new(shape.clone(), z))?;
        self.queue_update();
        Ok(())
    }

    /// Remove a shape from storage. Returns false if it was not there.
    pub fn delete_shape_from_storage(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let removed = self.storage.delete_shape(id)?;
        if removed {
            self.queue_update();
        }
        Ok(removed)
    }

    /// Remove every shape from storage.
    pub fn delete_all_shapes(&mut self) -> Result<usize, CrdtError> {
        let removed = self.storage.clear_shapes()?;
        self.queue_update();
        Ok(removed)
    }

    /// Write a batch of canvas edits through to storage.
    pub fn apply_edits(&mut self, canvas: &Canvas, edits: &[CanvasEdit]) -> Result<(), CrdtError> {
        for edit in edits {
            match *edit {
                CanvasEdit::Upsert(id) => {
                    if let Some(shape) = canvas.document.get_shape(id) {
                        self.sync_shape_in_storage(shape)?;
                    }
                }
                CanvasEdit::Delete(id) => {
                    self.delete_shape_from_storage(id)?;
                }
            }
        }
        Ok(())
    }

    pub fn bring_to_front(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let moved = self.storage.bring_to_front(id)?;
        self.after_reorder(moved)
    }

    pub fn send_to_back(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let moved = self.storage.send_to_back(id)?;
        self.after_reorder(moved)
    }

    pub fn bring_forward(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let moved = self.storage.bring_forward(id)?;
        self.after_reorder(moved)
    }

    pub fn send_backward(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let moved = self.storage.send_backward(id)?;
        self.after_reorder(moved)
    }

    fn after_reorder(&mut self, moved: bool) -> Result<bool, CrdtError> {
        if moved {
            // Local reorders change the projection too.
            self.storage_changed = true;
            self.queue_update();
        }
        Ok(moved)
    }

    /// Rebuild the canvas document from storage in z order. Selected ids
    /// that still exist stay selected.
    pub fn render_canvas(&self, canvas: &mut Canvas) {
        let doc = &mut canvas.document;
        doc.clear();
        for record in self.storage.shape_records() {
            doc.add_shape(record.shape);
        }
        canvas.retain_existing_selection();
    }

    // --- Comments ---

    /// Create a thread on top of the others, with a first comment.
    pub fn create_thread(
        &mut self,
        anchor: Point,
        author: &str,
        body: &str,
    ) -> Result<ThreadId, CommentError> {
        let comment = Comment::new(author, body)?;
        let mut thread = CommentThread::new(anchor, next_z_index(&self.storage.threads()));
        thread.comments.push(comment);
        self.write_thread(&thread)?;
        Ok(thread.id)
    }

    /// Append a reply to a thread.
    pub fn add_comment(&mut self, id: ThreadId, author: &str, body: &str) -> Result<(), CommentError> {
        let comment = Comment::new(author, body)?;
        let mut thread = self.thread(id)?;
        thread.comments.push(comment);
        self.write_thread(&thread)
    }

    pub fn set_resolved(&mut self, id: ThreadId, resolved: bool) -> Result<(), CommentError> {
        let mut thread = self.thread(id)?;
        thread.resolved = resolved;
        self.write_thread(&thread)
    }

    pub fn move_thread(&mut self, id: ThreadId, anchor: Point) -> Result<(), CommentError> {
        let mut thread = self.thread(id)?;
        thread.set_anchor(anchor);
        self.write_thread(&thread)
    }

    pub fn bring_thread_to_front(&mut self, id: ThreadId) -> Result<(), CommentError> {
        let threads = self.storage.threads();
        let mut thread = self.thread(id)?;
        let top = next_z_index(threads.iter().filter(|t| t.id != id));
        if thread.z_index >= top {
            return Ok(());
        }
        thread.z_index = top;
        self.write_thread(&thread)
    }

    pub fn delete_thread(&mut self, id: ThreadId) -> Result<(), CommentError> {
        if !self.storage.delete_thread(id)? {
            return Err(CommentError::NotFound(id));
        }
        self.storage_changed = true;
        self.queue_update();
        Ok(())
    }

    /// Threads bottom to top.
    pub fn ordered_threads(&self) -> Vec<CommentThread> {
        let mut threads = self.storage.threads();
        sort_threads(&mut threads);
        threads
    }

    fn thread(&self, id: ThreadId) -> Result<CommentThread, CommentError> {
        self.storage.get_thread(id).ok_or(CommentError::NotFound(id))
    }

    fn write_thread(&mut self, thread: &CommentThread) -> Result<(), CommentError> {
        self.storage.upsert_thread(thread)?;
        self.storage_changed = true;
        self.queue_update();
        Ok(())
    }

    // --- Undo/Redo ---

    /// Undo the last local change.
    pub fn undo(&mut self) -> bool {
        let undone = self.storage.undo();
        if undone {
            self.storage_changed = true;
            self.queue_update();
        }
        undone
    }

    /// Redo the last undone change.
    pub fn redo(&mut self) -> bool {
        let redone = self.storage.redo();
        if redone {
            self.storage_changed = true;
            self.queue_update();
        }
        redone
    }

    pub fn can_undo(&self) -> bool {
        self.storage.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.storage.can_redo()
    }

    /// Group the writes until `end_undo_group` into one undo step.
    pub fn start_undo_group(&mut self) {
        self.storage.start_undo_group();
    }

    pub fn end_undo_group(&mut self) {
        self.storage.end_undo_group();
    }

    // --- Room/Connection Management ---

    /// Get the current room ID.
    pub fn current_room(&self) -> Option<&str> {
        self.current_room.as_deref()
    }

    /// Check if we're in a room.
    pub fn is_in_room(&self) -> bool {
        self.current_room.is_some()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Request to join a room. Queues the join message.
    pub fn join_room(&mut self, room: &str) {
        self.queue(&ClientMessage::Join {
            room: room.to_string(),
            public_key: self.public_key.clone(),
        });
    }

    /// Request to leave the current room. Queues the leave message.
    pub fn leave_room(&mut self) {
        if self.current_room.take().is_some() {
            self.queue(&ClientMessage::Leave);
            self.connection_id = None;
            self.roster.clear();
        }
    }

    /// Forget the room after the transport dropped.
    pub fn connection_lost(&mut self) {
        self.current_room = None;
        self.connection_id = None;
        self.roster.clear();
    }

    /// Take pending outgoing messages (drains the queue).
    pub fn take_outgoing(&mut self) -> Vec<String> {
        std::mem::take(&mut self.outgoing)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Read and clear the "storage changed" flag.
    pub fn take_storage_changed(&mut self) -> bool {
        std::mem::take(&mut self.storage_changed)
    }

    fn queue(&mut self, msg: &ClientMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.outgoing.push(json),
            Err(e) => log::warn!("Failed to encode outgoing message: {}", e),
        }
    }

    /// Queue everything written since the last sent version.
    fn queue_update(&mut self) {
        if self.current_room.is_none() {
            return;
        }
        let version = self.storage.version();
        if version == self.last_sent {
            return;
        }
        match self.storage.export_updates(&self.last_sent) {
            Ok(bytes) => {
                log::debug!("Queueing {} bytes of updates", bytes.len());
                self.queue(&ClientMessage::Sync {
                    data: encode_payload(&bytes),
                });
                self.last_sent = version;
            }
            Err(e) => log::warn!("Failed to export updates: {}", e),
        }
    }

    // --- Presence ---

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    pub fn reactions(&self) -> &ReactionLog {
        &self.reactions
    }

    /// Forget reactions that have faded out.
    pub fn prune_reactions(&mut self, now: Instant) {
        self.reactions.prune(now);
    }

    /// Update the local cursor. At most one update per throttle interval is
    /// sent; a held-back position goes out from `flush_presence`.
    pub fn set_cursor(&mut self, position: Option<Point>, now: Instant) {
        self.presence.cursor = position.map(CursorPosition::from);
        if position.is_none() || self.cursor_throttle.ready(now) {
            self.cursor_pending = false;
            self.queue_presence();
        } else {
            self.cursor_pending = true;
        }
    }

    /// Send a held-back cursor position once the throttle allows it.
    pub fn flush_presence(&mut self, now: Instant) {
        if self.cursor_pending && self.cursor_throttle.ready(now) {
            self.cursor_pending = false;
            self.queue_presence();
        }
    }

    /// Change the cursor mode. Mode changes are sent immediately.
    pub fn set_cursor_mode(&mut self, mode: CursorMode) {
        if self.presence.mode != mode {
            self.presence.mode = mode;
            self.cursor_pending = false;
            self.queue_presence();
        }
    }

    pub fn set_user_info(&mut self, name: String, color: String) {
        self.presence.user = Some(UserInfo { name, color });
        self.queue_presence();
    }

    pub fn set_presence_selection(&mut self, selection: Option<ShapeId>) {
        if self.presence.selection != selection {
            self.presence.selection = selection;
            self.queue_presence();
        }
    }

    fn queue_presence(&mut self) {
        if self.current_room.is_some() {
            self.queue(&ClientMessage::Presence {
                presence: self.presence.clone(),
            });
        }
    }

    /// Broadcast a reaction and show it locally.
    pub fn send_reaction(&mut self, reaction: ReactionEvent, now: Instant) {
        self.reactions.push(reaction.clone(), now);
        if self.current_room.is_some() {
            self.queue(&ClientMessage::Broadcast {
                event: BroadcastEvent::Reaction(reaction),
            });
        }
    }

    // --- Incoming Message Handling ---

    /// Handle an incoming server message.
    /// Returns a SyncEvent describing what happened, or `None` for messages
    /// that were malformed and dropped.
    pub fn handle_message(&mut self, json: &str) -> Option<SyncEvent> {
        self.handle_message_at(json, Instant::now())
    }

    pub fn handle_message_at(&mut self, json: &str, now: Instant) -> Option<SyncEvent> {
        let msg: ServerMessage = match serde_json::from_str(json) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Dropping malformed server message: {}", e);
                return None;
            }
        };

        match msg {
            ServerMessage::Joined {
                room,
                connection_id,
                peer_count,
                initial_sync,
                others,
            } => {
                log::info!("Joined room {} as {} ({} peers)", room, connection_id, peer_count);
                self.current_room = Some(room.clone());
                self.connection_id = Some(connection_id.clone());

                self.last_sent = VersionVector::default();
                if let Some(data) = initial_sync {
                    self.import_initial_sync(&data);
                }
                self.roster.clear();
                for peer in others {
                    self.roster.update(peer.connection_id, peer.presence);
                }

                // Send local edits the room has not seen, then our presence.
                self.queue_update();
                self.queue_presence();

                Some(SyncEvent::JoinedRoom {
                    room,
                    connection_id,
                    peer_count,
                })
            }
            ServerMessage::PeerJoined { peer_id } => {
                log::info!("Peer joined: {}", peer_id);
                Some(SyncEvent::PeerJoined { peer_id })
            }
            ServerMessage::PeerLeft { peer_id } => {
                log::info!("Peer left: {}", peer_id);
                self.roster.remove(&peer_id);
                Some(SyncEvent::PeerLeft { peer_id })
            }
            ServerMessage::Sync { from, data } => {
                let changed = self.import_remote(&data)?;
                Some(SyncEvent::StorageUpdated { from, changed })
            }
            ServerMessage::Presence { from, presence } => {
                self.roster.update(from.clone(), presence);
                Some(SyncEvent::PresenceUpdated { from })
            }
            ServerMessage::Broadcast { from, event } => {
                match &event {
                    BroadcastEvent::Reaction(reaction) => self.reactions.push(reaction.clone(), now),
                }
                Some(SyncEvent::Broadcast { from, event })
            }
            ServerMessage::Error { message } => {
                log::warn!("Server error: {}", message);
                Some(SyncEvent::Error { message })
            }
        }
    }

    /// Import the room snapshot; afterwards only ops the room lacks are sent.
    fn import_initial_sync(&mut self, data: &str) {
        let bytes = match decode_payload(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Dropping initial sync: {}", e);
                return;
            }
        };
        let room_doc = LoroDoc::new();
        match room_doc.import(&bytes) {
            Ok(_) => self.last_sent = room_doc.oplog_vv(),
            Err(e) => {
                log::warn!("Dropping initial sync: {}", e);
                return;
            }
        }
        match self.storage.import(&bytes) {
            Ok(changed) => self.storage_changed |= changed,
            Err(e) => log::warn!("Failed to import initial sync: {}", e),
        }
    }

    /// Import a remote update. Returns `None` when the payload is unusable.
    fn import_remote(&mut self, data: &str) -> Option<bool> {
        let bytes = match decode_payload(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Dropping sync payload: {}", e);
                return None;
            }
        };
        let before = self.storage.version();
        match self.storage.import(&bytes) {
            Ok(changed) => {
                if self.last_sent == before {
                    self.last_sent = self.storage.version();
                }
                self.storage_changed |= changed;
                Some(changed)
            }
            Err(e) => {
                log::warn!("Failed to import sync payload: {}", e);
                None
            }
        }
    }
}

impl Default for SyncAdapter {
    fn default() -> Self {
        Self::new()
    }
}
