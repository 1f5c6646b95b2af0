//! An editing session: one canvas, its sync adapter, a transport and a renderer.
//!
//! Input mutates the local canvas and is written through to storage right
//! away. Rendering happens in [`Session::tick`], which rebuilds the canvas
//! from storage when it changed and draws at most once per render interval.

use std::time::Instant;

use kurbo::{Point, Vec2};

use crate::canvas::{Canvas, CanvasEdit};
use crate::collaboration::SyncAdapter;
use crate::comments::{CommentError, ThreadId};
use crate::crdt::CrdtError;
use crate::input::{Action, KeyEvent, PointerEvent};
use crate::presence::{CursorMode, ReactionEvent};
use crate::render::{RenderContext, Renderer};
use crate::shapes::{ShapeAttribute, ShapeId};
use crate::sync::{SyncEvent, Transport, TransportEvent};
use crate::throttle::Throttle;

pub struct Session<R: Renderer> {
    pub canvas: Canvas,
    adapter: SyncAdapter,
    transport: Option<Box<dyn Transport>>,
    /// Room to join whenever the transport connects.
    room: Option<String>,
    renderer: R,
    render_throttle: Throttle,
    needs_render: bool,
    /// Display name used for comments.
    author: String,
    /// Anchor picked with the comment tool, waiting for a body.
    comment_anchor: Option<Point>,
    last_pointer: Option<Point>,
    undo_group_open: bool,
}

impl<R: Renderer> Session<R> {
    pub fn new(renderer: R) -> Self {
        Self::with_adapter(SyncAdapter::new(), renderer)
    }

    pub fn with_adapter(adapter: SyncAdapter, renderer: R) -> Self {
        Self {
            canvas: Canvas::new(),
            adapter,
            transport: None,
            room: None,
            renderer,
            render_throttle: Throttle::default(),
            needs_render: true,
            author: "Anonymous".to_string(),
            comment_anchor: None,
            last_pointer: None,
            undo_group_open: false,
        }
    }

    pub fn set_author(&mut self, author: impl Into<String>) {
        self.author = author.into();
    }

    pub fn adapter(&self) -> &SyncAdapter {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut SyncAdapter {
        &mut self.adapter
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Attach a transport and join `room` once it is connected.
    pub fn connect(&mut self, transport: Box<dyn Transport>, room: impl Into<String>) {
        let room = room.into();
        if transport.is_connected() {
            self.adapter.join_room(&room);
        }
        self.room = Some(room);
        self.transport = Some(transport);
    }

    /// Leave the room and drop the transport.
    pub fn disconnect(&mut self) {
        self.adapter.leave_room();
        self.flush_outgoing();
        self.transport = None;
        self.room = None;
        self.adapter.connection_lost();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    // --- Input ---

    /// Route a pointer event to the canvas and write the resulting edits
    /// through to storage.
    pub fn handle_pointer(&mut self, event: &PointerEvent, now: Instant) -> Result<(), CrdtError> {
        self.last_pointer = event.position();
        self.adapter.set_cursor(event.position(), now);

        if let CursorMode::Reaction { reaction, .. } = self.adapter.presence().mode.clone() {
            self.handle_reaction_pointer(event, reaction, now);
            return Ok(());
        }

        // One drag or draw is one undo step.
        if matches!(event, PointerEvent::Down { .. }) && !self.undo_group_open {
            self.adapter.start_undo_group();
            self.undo_group_open = true;
        }

        let edits = self.canvas.handle_pointer(event);
        let result = self.adapter.apply_edits(&self.canvas, &edits);
        if !edits.is_empty() {
            self.needs_render = true;
        }

        if matches!(event, PointerEvent::Up { .. } | PointerEvent::Leave) && self.undo_group_open {
            self.adapter.end_undo_group();
            self.undo_group_open = false;
        }
        if let Some(anchor) = self.canvas.take_pending_comment() {
            self.comment_anchor = Some(anchor);
        }
        self.adapter
            .set_presence_selection(self.canvas.selection.first().copied());
        result
    }

    fn handle_reaction_pointer(&mut self, event: &PointerEvent, reaction: String, now: Instant) {
        match *event {
            PointerEvent::Down { position, .. } => {
                self.adapter.send_reaction(
                    ReactionEvent {
                        x: position.x,
                        y: position.y,
                        value: reaction.clone(),
                    },
                    now,
                );
                self.adapter.set_cursor_mode(CursorMode::Reaction {
                    reaction,
                    is_pressed: true,
                });
                self.needs_render = true;
            }
            PointerEvent::Up { .. } | PointerEvent::Leave => {
                self.adapter.set_cursor_mode(CursorMode::Reaction {
                    reaction,
                    is_pressed: false,
                });
            }
            PointerEvent::Move { .. } => {}
        }
    }

    /// Handle a key press. Returns the action it triggered, if any.
    pub fn handle_key(&mut self, event: &KeyEvent) -> Result<Option<Action>, CrdtError> {
        if let CursorMode::Chat {
            message,
            previous_message,
        } = self.adapter.presence().mode.clone()
        {
            self.handle_chat_key(event, message, previous_message);
            return Ok(None);
        }

        let Some(action) = Action::from_key(event) else {
            return Ok(None);
        };
        match action {
            Action::DeleteSelection => {
                let edits = self.canvas.delete_selected();
                self.write_edits(&edits)?;
            }
            Action::Undo => {
                self.adapter.undo();
            }
            Action::Redo => {
                self.adapter.redo();
            }
            Action::Copy => {
                self.canvas.copy_selection();
            }
            Action::Paste => {
                let edits = self.canvas.paste();
                self.write_edits(&edits)?;
            }
            Action::SelectAll => {
                self.canvas.select_all();
                self.needs_render = true;
            }
            Action::StartChat => self.adapter.set_cursor_mode(CursorMode::Chat {
                message: String::new(),
                previous_message: None,
            }),
            Action::OpenReactions => self.adapter.set_cursor_mode(CursorMode::ReactionSelector),
            Action::Escape => {
                self.canvas.cancel_interaction();
                self.comment_anchor = None;
                self.adapter.set_cursor_mode(CursorMode::Hidden);
            }
        }
        self.adapter
            .set_presence_selection(self.canvas.selection.first().copied());
        Ok(Some(action))
    }

    /// Keys typed while the chat bubble is open edit the message.
    fn handle_chat_key(&mut self, event: &KeyEvent, mut message: String, previous: Option<String>) {
        let mode = match event.key.as_str() {
            "Escape" => CursorMode::Hidden,
            "Enter" => CursorMode::Chat {
                previous_message: Some(message),
                message: String::new(),
            },
            "Backspace" => {
                message.pop();
                CursorMode::Chat {
                    message,
                    previous_message: previous,
                }
            }
            key if key.chars().count() == 1 && !event.modifiers.command() => {
                message.push_str(key);
                CursorMode::Chat {
                    message,
                    previous_message: previous,
                }
            }
            _ => return,
        };
        self.adapter.set_cursor_mode(mode);
    }

    // --- Editing ---

    /// Apply an attribute to every selected shape that supports it.
    /// Returns how many shapes changed.
    pub fn apply_attribute(&mut self, attribute: &ShapeAttribute) -> Result<usize, CrdtError> {
        let edits = self.canvas.apply_to_selection(attribute);
        self.write_edits(&edits)?;
        Ok(edits.len())
    }

    /// Replace the content of a text shape. Returns false if `id` is not text.
    pub fn set_text(&mut self, id: ShapeId, content: &str) -> Result<bool, CrdtError> {
        let Some(edit) = self.canvas.set_text(id, content) else {
            return Ok(false);
        };
        self.write_edits(&[edit])?;
        Ok(true)
    }

    /// Move the selection by `delta`, as one undo step.
    pub fn nudge_selection(&mut self, delta: Vec2) -> Result<(), CrdtError> {
        let edits = self.canvas.translate_selection(delta);
        self.write_edits(&edits)
    }

    /// Raise the selection above every other shape, keeping its own order.
    pub fn bring_selection_to_front(&mut self) -> Result<bool, CrdtError> {
        let ids = self.selection_in_z_order();
        self.reorder(ids, SyncAdapter::bring_to_front)
    }

    /// Lower the selection below every other shape, keeping its own order.
    pub fn send_selection_to_back(&mut self) -> Result<bool, CrdtError> {
        let mut ids = self.selection_in_z_order();
        ids.reverse();
        self.reorder(ids, SyncAdapter::send_to_back)
    }

    /// Move each selected shape one layer up.
    pub fn bring_selection_forward(&mut self) -> Result<bool, CrdtError> {
        let mut ids = self.selection_in_z_order();
        ids.reverse();
        self.reorder(ids, SyncAdapter::bring_forward)
    }

    /// Move each selected shape one layer down.
    pub fn send_selection_backward(&mut self) -> Result<bool, CrdtError> {
        let ids = self.selection_in_z_order();
        self.reorder(ids, SyncAdapter::send_backward)
    }

    fn selection_in_z_order(&self) -> Vec<ShapeId> {
        self.canvas
            .document
            .shapes_ordered()
            .map(|shape| shape.id())
            .filter(|&id| self.canvas.is_selected(id))
            .collect()
    }

    fn reorder(
        &mut self,
        ids: Vec<ShapeId>,
        op: fn(&mut SyncAdapter, ShapeId) -> Result<bool, CrdtError>,
    ) -> Result<bool, CrdtError> {
        self.adapter.start_undo_group();
        let mut moved = false;
        let mut result = Ok(());
        for id in ids {
            match op(&mut self.adapter, id) {
                Ok(m) => moved |= m,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.adapter.end_undo_group();
        result?;
        Ok(moved)
    }

    /// Write local edits through to storage as one undo step.
    fn write_edits(&mut self, edits: &[CanvasEdit]) -> Result<(), CrdtError> {
        if edits.is_empty() {
            return Ok(());
        }
        self.adapter.start_undo_group();
        let result = self.adapter.apply_edits(&self.canvas, edits);
        self.adapter.end_undo_group();
        result?;
        self.needs_render = true;
        Ok(())
    }

    /// Switch the cursor to a reaction picked from the selector.
    pub fn select_reaction(&mut self, reaction: impl Into<String>) {
        self.adapter.set_cursor_mode(CursorMode::Reaction {
            reaction: reaction.into(),
            is_pressed: false,
        });
    }

    /// The anchor picked with the comment tool, if a comment is being drafted.
    pub fn comment_anchor(&self) -> Option<Point> {
        self.comment_anchor
    }

    /// Create a thread at the drafted anchor.
    pub fn submit_comment(&mut self, body: &str) -> Result<Option<ThreadId>, CommentError> {
        let Some(anchor) = self.comment_anchor else {
            return Ok(None);
        };
        let id = self.adapter.create_thread(anchor, &self.author, body)?;
        self.comment_anchor = None;
        Ok(Some(id))
    }

    // --- Network ---

    /// Move transport events into the adapter and send queued messages.
    pub fn poll_network(&mut self, now: Instant) -> Vec<SyncEvent> {
        let mut events = Vec::new();
        let incoming = match self.transport.as_mut() {
            Some(transport) => transport.poll_events(),
            None => return events,
        };

        for event in incoming {
            match event {
                TransportEvent::Connected => {
                    log::info!("Transport connected");
                    if let Some(room) = self.room.clone() {
                        self.adapter.join_room(&room);
                    }
                }
                TransportEvent::Disconnected => {
                    log::info!("Transport disconnected");
                    self.adapter.connection_lost();
                    self.needs_render = true;
                }
                TransportEvent::Error(e) => log::warn!("Transport error: {}", e),
                TransportEvent::Message(json) => {
                    if let Some(event) = self.adapter.handle_message_at(&json, now) {
                        if matches!(
                            event,
                            SyncEvent::PresenceUpdated { .. }
                                | SyncEvent::PeerLeft { .. }
                                | SyncEvent::Broadcast { .. }
                        ) {
                            self.needs_render = true;
                        }
                        events.push(event);
                    }
                }
            }
        }

        self.adapter.flush_presence(now);
        self.flush_outgoing();
        events
    }

    fn flush_outgoing(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !transport.is_connected() {
            return;
        }
        for msg in self.adapter.take_outgoing() {
            if let Err(e) = transport.send(&msg) {
                log::warn!("Failed to send message: {}", e);
                break;
            }
        }
    }

    // --- Rendering ---

    /// Rebuild the canvas if storage changed and draw a frame when the
    /// render throttle allows. Returns true if a frame was drawn.
    pub fn tick(&mut self, now: Instant) -> bool {
        if self.adapter.take_storage_changed() {
            self.adapter.render_canvas(&mut self.canvas);
            self.needs_render = true;
        }
        if !self.adapter.reactions().is_empty() {
            self.adapter.prune_reactions(now);
            self.needs_render = true;
        }
        if !self.needs_render || !self.render_throttle.ready(now) {
            return false;
        }

        let threads = self.adapter.ordered_threads();
        let cursors = self
            .adapter
            .roster()
            .visible_cursors()
            .map(|(id, cursor)| (id.as_str(), cursor))
            .collect();
        let reactions = self.adapter.reactions().active(now).collect();
        let ctx = RenderContext::new(&self.canvas)
            .with_threads(&threads)
            .with_cursors(cursors)
            .with_reactions(reactions);
        self.renderer.render(&ctx);
        self.needs_render = false;
        true
    }

    /// Last pointer position on the canvas.
    pub fn pointer(&self) -> Option<Point> {
        self.last_pointer
    }
}
