//! Text shape.

use super::{ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Font family used when none is chosen.
pub const DEFAULT_FONT_FAMILY: &str = "Helvetica";

/// Font weight options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FontWeight {
    Light,
    #[default]
    Regular,
    SemiBold,
    Bold,
}

impl FontWeight {
    /// Numeric CSS weight.
    pub fn css_weight(&self) -> u16 {
        match self {
            FontWeight::Light => 400,
            FontWeight::Regular => 500,
            FontWeight::SemiBold => 600,
            FontWeight::Bold => 700,
        }
    }
}

/// A text shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Text {
    pub(crate) id: ShapeId,
    /// Position (top-left corner of text bounding box).
    pub position: Point,
    /// The text content.
    pub content: String,
    /// Font size in pixels.
    pub font_size: f64,
    pub font_family: String,
    pub font_weight: FontWeight,
    /// Rotation angle in radians (around center).
    #[serde(default)]
    pub rotation: f64,
    pub style: ShapeStyle,
}

impl Text {
    pub const DEFAULT_FONT_SIZE: f64 = 36.0;

    pub fn new(position: Point, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            content,
            font_size: Self::DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
            font_weight: FontWeight::default(),
            rotation: 0.0,
            style: ShapeStyle::default(),
        }
    }

    /// Approximate layout size. Without a shaping engine each character is
    /// taken as 0.6 em wide and each line as 1.2 em tall.
    pub fn approx_size(&self) -> (f64, f64) {
        let lines: Vec<&str> = self.content.lines().collect();
        let longest = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
        let line_count = lines.len().max(1);
        let width = (longest.max(1) as f64) * self.font_size * 0.6;
        let height = line_count as f64 * self.font_size * 1.2;
        (width, height)
    }
}

impl ShapeTrait for Text {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn bounds(&self) -> Rect {
        let (width, height) = self.approx_size();
        Rect::new(
            self.position.x,
            self.position.y,
            self.position.x + width,
            self.position.y + height,
        )
    }

    fn hit_test(&self, point: Point, tolerance: f64) -> bool {
        self.bounds().inflate(tolerance, tolerance).contains(point)
    }

    fn style(&self) -> &ShapeStyle {
        &self.style
    }

    fn style_mut(&mut self) -> &mut ShapeStyle {
        &mut self.style
    }

    fn transform(&mut self, affine: Affine) {
        self.position = affine * self.position;
        let scale = affine.as_coeffs();
        self.font_size *= scale[3].abs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approx_size_multiline() {
        let mut text = Text::new(Point::ZERO, "ab\nabcd".to_string());
        text.font_size = 10.0;
        let (w, h) = text.approx_size();
        assert!((w - 24.0).abs() < 1e-9);
        assert!((h - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_text_still_hittable() {
        let text = Text::new(Point::new(10.0, 10.0), String::new());
        assert!(text.hit_test(Point::new(12.0, 12.0), 0.0));
    }
}
