//! Tool system for the canvas.

use crate::shapes::{Ellipse, Freehand, Image, Line, Rectangle, Shape, ShapeStyle, Text, Triangle};
use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

/// Drags shorter than this in either direction do not create a shape.
pub const MIN_SHAPE_SIZE: f64 = 4.0;

/// Tolerance used to thin freehand strokes when they are finished.
const FREEHAND_SIMPLIFY_TOLERANCE: f64 = 0.5;

/// Available tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Select,
    Rectangle,
    Ellipse,
    Triangle,
    Line,
    Freehand,
    Text,
    Image,
    /// Places a comment thread instead of a shape.
    Comment,
}

impl ToolKind {
    /// Whether the tool draws a shape when a drag ends.
    pub fn creates_shape(&self) -> bool {
        !matches!(self, ToolKind::Select | ToolKind::Comment)
    }

    /// Tools that place something at the press position regardless of drag size.
    fn ignores_min_size(&self) -> bool {
        matches!(self, ToolKind::Text | ToolKind::Freehand | ToolKind::Image)
    }
}

/// Image waiting to be placed with the image tool.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingImage {
    pub src: String,
    pub natural_width: u32,
    pub natural_height: u32,
}

/// State of a tool interaction.
#[derive(Debug, Clone, Default)]
pub enum ToolState {
    /// Tool is idle, waiting for interaction.
    #[default]
    Idle,
    /// Tool is actively being used (e.g., drawing a shape).
    Active {
        /// Starting point of the interaction.
        start: Point,
        /// Current point of the interaction.
        current: Point,
    },
}

/// Manages the current tool and its state.
#[derive(Debug, Clone, Default)]
pub struct ToolManager {
    /// Currently selected tool.
    pub current_tool: ToolKind,
    /// Current state of the tool.
    pub state: ToolState,
    /// Accumulated points for freehand drawing.
    freehand_points: Vec<Point>,
    /// Current style to apply to new shapes.
    pub current_style: ShapeStyle,
    /// Corner radius for new rectangles (0 = sharp corners).
    pub corner_radius: f64,
    /// Image placed by the next image tool click.
    pub pending_image: Option<PendingImage>,
}

impl ToolManager {
    /// Create a new tool manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current tool.
    pub fn set_tool(&mut self, tool: ToolKind) {
        self.current_tool = tool;
        self.cancel();
    }

    /// Begin a tool interaction.
    pub fn begin(&mut self, point: Point) {
        self.freehand_points.clear();
        if self.current_tool == ToolKind::Freehand {
            self.freehand_points.push(point);
        }
        self.state = ToolState::Active {
            start: point,
            current: point,
        };
    }

    /// Update the current interaction.
    pub fn update(&mut self, point: Point) {
        if let ToolState::Active { current, .. } = &mut self.state {
            *current = point;
            if self.current_tool == ToolKind::Freehand {
                self.freehand_points.push(point);
            }
        }
    }

    /// End the current interaction and return any created shape.
    pub fn end(&mut self, point: Point) -> Option<Shape> {
        let ToolState::Active { start, .. } = self.state else {
            return None;
        };
        if self.current_tool == ToolKind::Freehand
            && self.freehand_points.last() != Some(&point)
        {
            self.freehand_points.push(point);
        }

        let shape = if self.current_tool.ignores_min_size() || is_large_enough(self.current_tool, start, point) {
            self.create_shape(start, point)
        } else {
            None
        };

        if self.current_tool == ToolKind::Image && shape.is_some() {
            self.pending_image = None;
        }
        self.state = ToolState::Idle;
        self.freehand_points.clear();
        shape.map(|mut s| {
            if let Shape::Freehand(f) = &mut s {
                f.simplify(FREEHAND_SIMPLIFY_TOLERANCE);
            }
            s
        })
    }

    /// Cancel the current interaction.
    pub fn cancel(&mut self) {
        self.state = ToolState::Idle;
        self.freehand_points.clear();
    }

    /// Check if a tool interaction is active.
    pub fn is_active(&self) -> bool {
        matches!(self.state, ToolState::Active { .. })
    }

    /// Start point of the active interaction.
    pub fn drag_start(&self) -> Option<Point> {
        match self.state {
            ToolState::Active { start, .. } => Some(start),
            ToolState::Idle => None,
        }
    }

    /// Get the preview shape for the current interaction.
    pub fn preview_shape(&self) -> Option<Shape> {
        match self.state {
            ToolState::Active { .. } if self.current_tool == ToolKind::Freehand => {
                if self.freehand_points.len() >= 2 {
                    self.create_shape(Point::ZERO, Point::ZERO)
                } else {
                    None
                }
            }
            ToolState::Active { start, current } => self.create_shape(start, current),
            ToolState::Idle => None,
        }
    }

    /// Get the accumulated freehand points.
    pub fn freehand_points(&self) -> &[Point] {
        &self.freehand_points
    }

    /// Create a shape from start and end points.
    fn create_shape(&self, start: Point, end: Point) -> Option<Shape> {
        let mut shape = match self.current_tool {
            ToolKind::Rectangle => {
                let mut rect = Rectangle::from_corners(start, end);
                rect.corner_radius = self.corner_radius;
                Shape::Rectangle(rect)
            }
            ToolKind::Ellipse => Shape::Ellipse(Ellipse::from_rect(Rect::from_points(start, end))),
            ToolKind::Triangle => Shape::Triangle(Triangle::from_corners(start, end)),
            ToolKind::Line => Shape::Line(Line::new(start, end)),
            ToolKind::Freehand => {
                if self.freehand_points.is_empty() {
                    return None;
                }
                Shape::Freehand(Freehand::from_points(self.freehand_points.clone()))
            }
            // Text is created at the click position with empty content
            ToolKind::Text => Shape::Text(Text::new(start, String::new())),
            ToolKind::Image => {
                let pending = self.pending_image.as_ref()?;
                let image = Image::fitted(
                    start,
                    pending.natural_width,
                    pending.natural_height,
                    pending.src.clone(),
                );
                // Images keep their own chrome.
                return Some(Shape::Image(image));
            }
            ToolKind::Select | ToolKind::Comment => return None,
        };

        let style = shape.style_mut();
        let keep_fill = style.fill_color.is_some();
        *style = self.current_style.clone();
        // Open shapes never fill.
        if !keep_fill {
            style.fill_color = None;
        }
        Some(shape)
    }
}

fn is_large_enough(tool: ToolKind, start: Point, end: Point) -> bool {
    match tool {
        ToolKind::Line => (end - start).hypot() >= MIN_SHAPE_SIZE,
        _ => (end.x - start.x).abs() >= MIN_SHAPE_SIZE && (end.y - start.y).abs() >= MIN_SHAPE_SIZE,
    }
}
