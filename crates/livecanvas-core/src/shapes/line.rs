//! Line shape.

use super::{point_to_segment_dist, ShapeId, ShapeStyle, ShapeTrait};
use kurbo::{Affine, Point, Rect};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A straight line segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub(crate) id: ShapeId,
    pub start: Point,
    pub end: Point,
    pub style: ShapeStyle,
}

impl Line {
    /// Create a new line. Lines have no fill.
    pub fn new(start: Point, end: Point) -> Self {
        let style = ShapeStyle {
            fill_color: None,
            ..ShapeStyle::default()
        };
        Self {
            id: Uuid::new_v4(),
            start,
            end,
            style,
        }
    }

    /// Length of the segment.
    pub fn length(&self) -> f64 {
        (self.end - self.start).hypot()
    }
}

impl ShapeTrait for Line {
    fn id(&self) -> ShapeId {
        self.id
    }

    fn bounds(&self) -> Rect {
        Rect::from_points(self.start, self.end)
    }

    fn hit_test(&self, point: Point, tolerance: f64) -> bool {
        point_to_segment_dist(point, self.start, self.end)
            <= tolerance + self.style.stroke_width / 2.0
    }

    fn style(&self) -> &ShapeStyle {
        &self.style
    }

    fn style_mut(&mut self) -> &mut ShapeStyle {
        &mut self.style
    }

    fn transform(&mut self, affine: Affine) {
        self.start = affine * self.start;
        self.end = affine * self.end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_hit_test() {
        let line = Line::new(Point::new(0.0, 0.0), Point::new(100.0, 0.0));
        assert!(line.hit_test(Point::new(50.0, 2.0), 2.0));
        assert!(!line.hit_test(Point::new(50.0, 10.0), 2.0));
    }

    #[test]
    fn test_line_bounds_are_normalized() {
        let line = Line::new(Point::new(100.0, 80.0), Point::new(0.0, 20.0));
        let bounds = line.bounds();
        assert!((bounds.x0 - 0.0).abs() < f64::EPSILON);
        assert!((bounds.y0 - 20.0).abs() < f64::EPSILON);
        assert!((line.length() - (100.0f64.powi(2) + 60.0f64.powi(2)).sqrt()).abs() < 1e-9);
    }
}
