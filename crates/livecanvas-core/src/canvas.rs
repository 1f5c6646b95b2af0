//! Canvas document and state management.

use crate::input::{Modifiers, PointerEvent};
use crate::shapes::{Shape, ShapeAttribute, ShapeId};
use crate::tools::{ToolKind, ToolManager};
use kurbo::{Affine, Point, Vec2};
use std::collections::HashMap;

/// Hit-test tolerance in canvas units.
pub const HIT_TOLERANCE: f64 = 4.0;

/// Offset applied to pasted shapes so they do not cover the originals.
const PASTE_OFFSET: f64 = 10.0;

/// The local projection of the shared map: every shape keyed by id plus
/// their render order. It is rebuilt from storage whenever storage changes.
#[derive(Debug, Clone, Default)]
pub struct CanvasDocument {
    /// All shapes in the document, keyed by ID.
    pub shapes: HashMap<ShapeId, Shape>,
    /// Z-order of shapes (back to front).
    pub z_order: Vec<ShapeId>,
}

impl CanvasDocument {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shape on top. Re-adding an existing id replaces it in place.
    pub fn add_shape(&mut self, shape: Shape) {
        let id = shape.id();
        if self.shapes.insert(id, shape).is_none() {
            self.z_order.push(id);
        }
    }

    /// Remove a shape from the document.
    pub fn remove_shape(&mut self, id: ShapeId) -> Option<Shape> {
        self.z_order.retain(|&shape_id| shape_id != id);
        self.shapes.remove(&id)
    }

    /// Clear all shapes from the document.
    pub fn clear(&mut self) {
        self.shapes.clear();
        self.z_order.clear();
    }

    /// Get a shape by ID.
    pub fn get_shape(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(&id)
    }

    /// Get a mutable reference to a shape by ID.
    pub fn get_shape_mut(&mut self, id: ShapeId) -> Option<&mut Shape> {
        self.shapes.get_mut(&id)
    }

    /// Get shapes in z-order (back to front).
    pub fn shapes_ordered(&self) -> impl Iterator<Item = &Shape> {
        self.z_order.iter().filter_map(|id| self.shapes.get(id))
    }

    /// Find shapes at a point, front to back.
    pub fn shapes_at_point(&self, point: Point, tolerance: f64) -> Vec<ShapeId> {
        self.z_order
            .iter()
            .rev()
            .filter_map(|&id| {
                self.shapes
                    .get(&id)
                    .filter(|s| s.hit_test(point, tolerance))
                    .map(|_| id)
            })
            .collect()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    /// Get the number of shapes.
    pub fn len(&self) -> usize {
        self.shapes.len()
    }
}

/// A local change that must be written to the shared map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanvasEdit {
    Upsert(ShapeId),
    Delete(ShapeId),
}

/// Runtime canvas state (not persisted).
#[derive(Debug, Clone, Default)]
pub struct Canvas {
    /// The document being edited.
    pub document: CanvasDocument,
    /// Tool manager.
    pub tool_manager: ToolManager,
    /// Currently selected shape IDs.
    pub selection: Vec<ShapeId>,
    /// Shapes copied with the copy action.
    clipboard: Vec<Shape>,
    /// Last pointer position while the select tool drags the selection.
    drag_anchor: Option<Point>,
    /// Where the comment tool was last released.
    pending_comment: Option<Point>,
}

impl Canvas {
    /// Create a new canvas with an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Select a shape (clears previous selection).
    pub fn select(&mut self, id: ShapeId) {
        self.selection.clear();
        self.selection.push(id);
    }

    pub fn add_to_selection(&mut self, id: ShapeId) {
        if !self.selection.contains(&id) {
            self.selection.push(id);
        }
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Select all shapes.
    pub fn select_all(&mut self) {
        self.selection = self.document.z_order.clone();
    }

    pub fn is_selected(&self, id: ShapeId) -> bool {
        self.selection.contains(&id)
    }

    /// Drop selected ids whose shapes no longer exist.
    pub fn retain_existing_selection(&mut self) {
        let shapes = &self.document.shapes;
        self.selection.retain(|id| shapes.contains_key(id));
    }

    /// Set the current tool.
    pub fn set_tool(&mut self, tool: ToolKind) {
        self.tool_manager.set_tool(tool);
        self.drag_anchor = None;
    }

    pub fn current_tool(&self) -> ToolKind {
        self.tool_manager.current_tool
    }

    /// Whether the select tool is dragging shapes.
    pub fn is_dragging(&self) -> bool {
        self.drag_anchor.is_some()
    }

    /// Take the anchor chosen with the comment tool, if any.
    pub fn take_pending_comment(&mut self) -> Option<Point> {
        self.pending_comment.take()
    }

    /// Route a pointer event to the current tool.
    pub fn handle_pointer(&mut self, event: &PointerEvent) -> Vec<CanvasEdit> {
        match *event {
            PointerEvent::Down { position, modifiers } => self.pointer_down(position, modifiers),
            PointerEvent::Move { position } => self.pointer_move(position),
            PointerEvent::Up { position } => self.pointer_up(position),
            PointerEvent::Leave => {
                self.cancel_interaction();
                Vec::new()
            }
        }
    }

    fn pointer_down(&mut self, point: Point, modifiers: Modifiers) -> Vec<CanvasEdit> {
        if self.current_tool() != ToolKind::Select {
            self.tool_manager.begin(point);
            return Vec::new();
        }

        match self.document.shapes_at_point(point, HIT_TOLERANCE).first() {
            Some(&id) => {
                if modifiers.shift {
                    self.add_to_selection(id);
                } else if !self.is_selected(id) {
                    self.select(id);
                }
                self.drag_anchor = Some(point);
            }
            None => {
                if !modifiers.shift {
                    self.clear_selection();
                }
            }
        }
        Vec::new()
    }

    fn pointer_move(&mut self, point: Point) -> Vec<CanvasEdit> {
        if let Some(anchor) = self.drag_anchor {
            let delta = point - anchor;
            self.drag_anchor = Some(point);
            return self.translate_selection(delta);
        }
        self.tool_manager.update(point);
        Vec::new()
    }

    fn pointer_up(&mut self, point: Point) -> Vec<CanvasEdit> {
        if self.drag_anchor.take().is_some() {
            return Vec::new();
        }
        if self.current_tool() == ToolKind::Comment {
            if self.tool_manager.is_active() {
                self.tool_manager.cancel();
                self.pending_comment = Some(point);
            }
            return Vec::new();
        }
        match self.tool_manager.end(point) {
            Some(shape) => {
                let id = shape.id();
                self.document.add_shape(shape);
                self.select(id);
                vec![CanvasEdit::Upsert(id)]
            }
            None => Vec::new(),
        }
    }

    /// Cancel drawing or dragging without creating anything.
    pub fn cancel_interaction(&mut self) {
        self.tool_manager.cancel();
        self.drag_anchor = None;
    }

    /// Move every selected shape by `delta`.
    pub fn translate_selection(&mut self, delta: Vec2) -> Vec<CanvasEdit> {
        if delta == Vec2::ZERO {
            return Vec::new();
        }
        let affine = Affine::translate(delta);
        let mut edits = Vec::new();
        for &id in &self.selection {
            if let Some(shape) = self.document.get_shape_mut(id) {
                shape.transform(affine);
                edits.push(CanvasEdit::Upsert(id));
            }
        }
        edits
    }

    /// Apply an attribute edit to every selected shape that supports it.
    pub fn apply_to_selection(&mut self, attribute: &ShapeAttribute) -> Vec<CanvasEdit> {
        let mut edits = Vec::new();
        for &id in &self.selection {
            if let Some(shape) = self.document.get_shape_mut(id) {
                if shape.apply_attribute(attribute) {
                    edits.push(CanvasEdit::Upsert(id));
                }
            }
        }
        edits
    }

    /// Replace the content of a text shape.
    pub fn set_text(&mut self, id: ShapeId, content: &str) -> Option<CanvasEdit> {
        match self.document.get_shape_mut(id) {
            Some(Shape::Text(text)) => {
                text.content = content.to_string();
                Some(CanvasEdit::Upsert(id))
            }
            _ => None,
        }
    }

    /// Delete selected shapes.
    pub fn delete_selected(&mut self) -> Vec<CanvasEdit> {
        let ids: Vec<ShapeId> = self.selection.drain(..).collect();
        ids.into_iter()
            .filter(|&id| self.document.remove_shape(id).is_some())
            .map(CanvasEdit::Delete)
            .collect()
    }

    /// Copy the selection to the local clipboard in z-order.
    pub fn copy_selection(&mut self) -> usize {
        self.clipboard = self
            .document
            .shapes_ordered()
            .filter(|s| self.selection.contains(&s.id()))
            .cloned()
            .collect();
        self.clipboard.len()
    }

    /// Paste clipboard shapes with fresh ids, offset from the originals.
    /// The pasted shapes become the selection.
    pub fn paste(&mut self) -> Vec<CanvasEdit> {
        let offset = Affine::translate((PASTE_OFFSET, PASTE_OFFSET));
        let mut pasted = Vec::with_capacity(self.clipboard.len());
        for shape in &mut self.clipboard {
            // Offset the clipboard too so repeated pastes cascade.
            shape.transform(offset);
            let mut copy = shape.clone();
            copy.regenerate_id();
            pasted.push(copy);
        }

        self.selection.clear();
        let mut edits = Vec::with_capacity(pasted.len());
        for shape in pasted {
            let id = shape.id();
            self.document.add_shape(shape);
            self.selection.push(id);
            edits.push(CanvasEdit::Upsert(id));
        }
        edits
    }
}
