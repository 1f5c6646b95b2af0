//! Shape definitions for the canvas.

mod ellipse;
mod freehand;
mod image;
mod line;
mod rectangle;
mod text;
mod triangle;

pub use ellipse::Ellipse;
pub use freehand::Freehand;
pub use image::Image;
pub use line::Line;
pub use rectangle::Rectangle;
pub use text::{FontWeight, Text, DEFAULT_FONT_FAMILY};
pub use triangle::Triangle;

use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serializable color representation (RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl SerializableColor {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0, 0, 0, 255)
    }

    pub fn white() -> Self {
        Self::new(255, 255, 255, 255)
    }

    pub fn transparent() -> Self {
        Self::new(0, 0, 0, 0)
    }

    /// Parse `#rgb`, `#rrggbb` or `#rrggbbaa`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().strip_prefix('#')?;
        let channel = |s: &str| u8::from_str_radix(s, 16).ok();
        match hex.len() {
            3 => {
                let mut out = [0u8; 3];
                for (i, c) in hex.chars().enumerate() {
                    let v = c.to_digit(16)? as u8;
                    out[i] = v * 17;
                }
                Some(Self::new(out[0], out[1], out[2], 255))
            }
            6 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                255,
            )),
            8 => Some(Self::new(
                channel(&hex[0..2])?,
                channel(&hex[2..4])?,
                channel(&hex[4..6])?,
                channel(&hex[6..8])?,
            )),
            _ => None,
        }
    }

    /// Format as `#rrggbb`, or `#rrggbbaa` when not fully opaque.
    pub fn to_hex(&self) -> String {
        if self.a == 255 {
            format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
        } else {
            format!("#{:02x}{:02x}{:02x}{:02x}", self.r, self.g, self.b, self.a)
        }
    }
}

/// Style properties for shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeStyle {
    /// Stroke color.
    pub stroke_color: SerializableColor,
    /// Stroke width.
    pub stroke_width: f64,
    /// Fill color (None = no fill).
    pub fill_color: Option<SerializableColor>,
    /// Overall opacity (0.0 = fully transparent, 1.0 = fully opaque).
    #[serde(default = "default_opacity")]
    pub opacity: f64,
}

fn default_opacity() -> f64 {
    1.0
}

impl Default for ShapeStyle {
    fn default() -> Self {
        Self {
            stroke_color: SerializableColor::black(),
            stroke_width: 2.0,
            fill_color: Some(SerializableColor::new(0xaa, 0xbb, 0xcc, 255)),
            opacity: 1.0,
        }
    }
}

/// Unique identifier for shapes.
pub type ShapeId = Uuid;

/// Distance from a point to a line segment (a to b).
pub fn point_to_segment_dist(point: Point, a: Point, b: Point) -> f64 {
    let seg = kurbo::Vec2::new(b.x - a.x, b.y - a.y);
    let pv = kurbo::Vec2::new(point.x - a.x, point.y - a.y);
    let len_sq = seg.hypot2();
    if len_sq < f64::EPSILON {
        return pv.hypot();
    }
    let t = (pv.dot(seg) / len_sq).clamp(0.0, 1.0);
    let proj = Point::new(a.x + t * seg.x, a.y + t * seg.y);
    ((point.x - proj.x).powi(2) + (point.y - proj.y).powi(2)).sqrt()
}

/// Minimum distance from a point to a polyline.
pub fn point_to_polyline_dist(point: Point, points: &[Point]) -> f64 {
    points
        .windows(2)
        .map(|w| point_to_segment_dist(point, w[0], w[1]))
        .fold(f64::INFINITY, f64::min)
}

/// Common trait for all shapes.
pub trait ShapeTrait {
    /// Get the unique identifier.
    fn id(&self) -> ShapeId;

    /// Get the bounding box in world coordinates.
    fn bounds(&self) -> Rect;

    /// Check if a point (in world coordinates) hits this shape.
    fn hit_test(&self, point: Point, tolerance: f64) -> bool;

    /// Get the style.
    fn style(&self) -> &ShapeStyle;

    /// Get mutable style.
    fn style_mut(&mut self) -> &mut ShapeStyle;

    /// Apply a transform (translation and axis scale) to this shape.
    fn transform(&mut self, affine: Affine);
}

/// A single editable property, as exposed by a properties panel.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeAttribute {
    Width(f64),
    Height(f64),
    Fill(Option<SerializableColor>),
    Stroke(SerializableColor),
    StrokeWidth(f64),
    Opacity(f64),
    FontSize(f64),
    FontFamily(String),
    FontWeight(FontWeight),
}

/// Enum wrapper for all shape types (for serialization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    Rectangle(Rectangle),
    Ellipse(Ellipse),
    Triangle(Triangle),
    Line(Line),
    Freehand(Freehand),
    Text(Text),
    Image(Image),
}

macro_rules! dispatch {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Shape::Rectangle($s) => $body,
            Shape::Ellipse($s) => $body,
            Shape::Triangle($s) => $body,
            Shape::Line($s) => $body,
            Shape::Freehand($s) => $body,
            Shape::Text($s) => $body,
            Shape::Image($s) => $body,
        }
    };
}

impl Shape {
    pub fn id(&self) -> ShapeId {
        dispatch!(self, s => s.id())
    }

    pub fn bounds(&self) -> Rect {
        dispatch!(self, s => s.bounds())
    }

    pub fn hit_test(&self, point: Point, tolerance: f64) -> bool {
        dispatch!(self, s => s.hit_test(point, tolerance))
    }

    pub fn style(&self) -> &ShapeStyle {
        dispatch!(self, s => s.style())
    }

    pub fn style_mut(&mut self) -> &mut ShapeStyle {
        dispatch!(self, s => s.style_mut())
    }

    pub fn transform(&mut self, affine: Affine) {
        dispatch!(self, s => s.transform(affine))
    }

    /// Short name of the shape kind, as used in rendered output.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Shape::Rectangle(_) => "rectangle",
            Shape::Ellipse(_) => "ellipse",
            Shape::Triangle(_) => "triangle",
            Shape::Line(_) => "line",
            Shape::Freehand(_) => "freehand",
            Shape::Text(_) => "text",
            Shape::Image(_) => "image",
        }
    }

    /// Regenerate the shape's ID with a new unique identifier.
    /// Used when pasting so copies never collide with their source.
    pub fn regenerate_id(&mut self) {
        let new_id = Uuid::new_v4();
        dispatch!(self, s => s.id = new_id)
    }

    /// Get the rotation angle in radians (0 for shapes that don't support rotation).
    pub fn rotation(&self) -> f64 {
        match self {
            Shape::Rectangle(r) => r.rotation,
            Shape::Ellipse(e) => e.rotation,
            Shape::Triangle(t) => t.rotation,
            Shape::Text(t) => t.rotation,
            Shape::Image(i) => i.rotation,
            Shape::Line(_) | Shape::Freehand(_) => 0.0,
        }
    }

    /// Set the rotation angle in radians.
    pub fn set_rotation(&mut self, rotation: f64) {
        match self {
            Shape::Rectangle(r) => r.rotation = rotation,
            Shape::Ellipse(e) => e.rotation = rotation,
            Shape::Triangle(t) => t.rotation = rotation,
            Shape::Text(t) => t.rotation = rotation,
            Shape::Image(i) => i.rotation = rotation,
            Shape::Line(_) | Shape::Freehand(_) => {}
        }
    }

    /// Check if this shape supports rotation.
    pub fn supports_rotation(&self) -> bool {
        !matches!(self, Shape::Line(_) | Shape::Freehand(_))
    }

    /// Apply an attribute edit. Returns false if the attribute does not
    /// apply to this kind of shape.
    pub fn apply_attribute(&mut self, attribute: &ShapeAttribute) -> bool {
        match attribute {
            ShapeAttribute::Fill(color) => {
                self.style_mut().fill_color = *color;
                true
            }
            ShapeAttribute::Stroke(color) => {
                self.style_mut().stroke_color = *color;
                true
            }
            ShapeAttribute::StrokeWidth(width) => {
                self.style_mut().stroke_width = width.max(0.0);
                true
            }
            ShapeAttribute::Opacity(opacity) => {
                self.style_mut().opacity = opacity.clamp(0.0, 1.0);
                true
            }
            ShapeAttribute::Width(width) => self.set_size(Some(*width), None),
            ShapeAttribute::Height(height) => self.set_size(None, Some(*height)),
            ShapeAttribute::FontSize(size) => match self {
                Shape::Text(t) => {
                    t.font_size = size.max(1.0);
                    true
                }
                _ => false,
            },
            ShapeAttribute::FontFamily(family) => match self {
                Shape::Text(t) => {
                    t.font_family = family.clone();
                    true
                }
                _ => false,
            },
            ShapeAttribute::FontWeight(weight) => match self {
                Shape::Text(t) => {
                    t.font_weight = *weight;
                    true
                }
                _ => false,
            },
        }
    }

    /// Resize so the bounding box gets the requested width and/or height.
    fn set_size(&mut self, width: Option<f64>, height: Option<f64>) -> bool {
        let bounds = self.bounds();
        let width = width.map(|w| w.max(0.0));
        let height = height.map(|h| h.max(0.0));
        match self {
            Shape::Rectangle(r) => {
                if let Some(w) = width {
                    r.width = w;
                }
                if let Some(h) = height {
                    r.height = h;
                }
                true
            }
            Shape::Triangle(t) => {
                if let Some(w) = width {
                    t.width = w;
                }
                if let Some(h) = height {
                    t.height = h;
                }
                true
            }
            Shape::Image(i) => {
                if let Some(w) = width {
                    i.width = w;
                }
                if let Some(h) = height {
                    i.height = h;
                }
                true
            }
            Shape::Ellipse(e) => {
                if let Some(w) = width {
                    e.radius_x = w / 2.0;
                }
                if let Some(h) = height {
                    e.radius_y = h / 2.0;
                }
                true
            }
            Shape::Line(_) | Shape::Freehand(_) => {
                let sx = match width {
                    Some(w) if bounds.width() > f64::EPSILON => w / bounds.width(),
                    _ => 1.0,
                };
                let sy = match height {
                    Some(h) if bounds.height() > f64::EPSILON => h / bounds.height(),
                    _ => 1.0,
                };
                let origin = bounds.origin().to_vec2();
                let affine = Affine::translate(origin)
                    * Affine::scale_non_uniform(sx, sy)
                    * Affine::translate(-origin);
                self.transform(affine);
                true
            }
            Shape::Text(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_hex_roundtrip() {
        let color = SerializableColor::from_hex("#14181f").unwrap();
        assert_eq!(color, SerializableColor::new(0x14, 0x18, 0x1f, 255));
        assert_eq!(color.to_hex(), "#14181f");

        let translucent = SerializableColor::new(255, 0, 0, 128);
        assert_eq!(translucent.to_hex(), "#ff000080");
        assert_eq!(SerializableColor::from_hex("#ff000080"), Some(translucent));
    }

    #[test]
    fn test_color_short_hex() {
        assert_eq!(
            SerializableColor::from_hex("#fff"),
            Some(SerializableColor::white())
        );
        assert_eq!(SerializableColor::from_hex("fff"), None);
        assert_eq!(SerializableColor::from_hex("#12345"), None);
    }

    #[test]
    fn test_shape_serde_tagged() {
        let shape = Shape::Rectangle(Rectangle::new(Point::new(1.0, 2.0), 3.0, 4.0));
        let json = serde_json::to_value(&shape).unwrap();
        assert_eq!(json["type"], "rectangle");
        let back: Shape = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_regenerate_id() {
        let mut shape = Shape::Ellipse(Ellipse::circle(Point::new(0.0, 0.0), 10.0));
        let before = shape.id();
        shape.regenerate_id();
        assert_ne!(before, shape.id());
    }

    #[test]
    fn test_apply_attribute_width_height() {
        let mut shape = Shape::Rectangle(Rectangle::new(Point::new(0.0, 0.0), 10.0, 10.0));
        assert!(shape.apply_attribute(&ShapeAttribute::Width(40.0)));
        assert!(shape.apply_attribute(&ShapeAttribute::Height(25.0)));
        let bounds = shape.bounds();
        assert!((bounds.width() - 40.0).abs() < 1e-9);
        assert!((bounds.height() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_apply_attribute_scales_line() {
        let mut shape = Shape::Line(Line::new(Point::new(10.0, 10.0), Point::new(20.0, 30.0)));
        assert!(shape.apply_attribute(&ShapeAttribute::Width(40.0)));
        let bounds = shape.bounds();
        assert!((bounds.x0 - 10.0).abs() < 1e-9);
        assert!((bounds.width() - 40.0).abs() < 1e-9);
        assert!((bounds.height() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_font_attributes_only_apply_to_text() {
        let mut rect = Shape::Rectangle(Rectangle::new(Point::ZERO, 10.0, 10.0));
        assert!(!rect.apply_attribute(&ShapeAttribute::FontSize(30.0)));

        let mut text = Shape::Text(Text::new(Point::ZERO, "hi".to_string()));
        assert!(text.apply_attribute(&ShapeAttribute::FontSize(30.0)));
        assert!(text.apply_attribute(&ShapeAttribute::FontWeight(FontWeight::Bold)));
        match text {
            Shape::Text(t) => {
                assert!((t.font_size - 30.0).abs() < f64::EPSILON);
                assert_eq!(t.font_weight, FontWeight::Bold);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_opacity_is_clamped() {
        let mut shape = Shape::Triangle(Triangle::new(Point::ZERO, 10.0, 10.0));
        shape.apply_attribute(&ShapeAttribute::Opacity(3.0));
        assert!((shape.style().opacity - 1.0).abs() < f64::EPSILON);
    }
}
