//! Image shape.

use super::{ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An image placed on the canvas.
///
/// `src` is either a URL or a `data:` URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub(crate) id: ShapeId,
    pub position: Point,
    /// Display width.
    pub width: f64,
    /// Display height.
    pub height: f64,
    pub src: String,
    #[serde(default)]
    pub rotation: f64,
    pub style: ShapeStyle,
}

impl Image {
    /// Longest side an inserted image is scaled down to.
    pub const MAX_INSERT_SIZE: f64 = 200.0;

    pub fn new(position: Point, width: f64, height: f64, src: String) -> Self {
        let style = ShapeStyle {
            fill_color: None,
            stroke_width: 0.0,
            ..ShapeStyle::default()
        };
        Self {
            id: Uuid::new_v4(),
            position,
            width,
            height,
            src,
            rotation: 0.0,
            style,
        }
    }

    /// Create an image from its natural size, scaled down so its longest
    /// side fits `MAX_INSERT_SIZE`.
    pub fn fitted(position: Point, natural_width: u32, natural_height: u32, src: String) -> Self {
        let (w, h) = (natural_width as f64, natural_height as f64);
        let longest = w.max(h);
        let scale = if longest > Self::MAX_INSERT_SIZE {
            Self::MAX_INSERT_SIZE / longest
        } else {
            1.0
        };
        Self::new(position, w * scale, h * scale, src)
    }
}

impl ShapeTrait for Image {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn bounds(&self) -> Rect {
        Rect::new(
            self.position.x,
            self.position.y,
            self.position.x + self.width,
            self.position.y + self.height,
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
        self.width *= scale[0].abs();
        self.height *= scale[3].abs();
    }
}
