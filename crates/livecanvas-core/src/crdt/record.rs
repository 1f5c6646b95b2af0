//! Plain records stored as values in the shared maps.

use loro::LoroValue;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::CrdtError;
use crate::shapes::{Shape, ShapeId};

/// A shape as stored in the shared map: the serialized shape plus its
/// z-order key. Records render in ascending `(z, id)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub shape: Shape,
    pub z: f64,
}

impl ShapeRecord {
    pub fn new(shape: Shape, z: f64) -> Self {
        Self { shape, z }
    }

    pub fn id(&self) -> ShapeId {
        self.shape.id()
    }
}

/// Total order used for rendering: z key first, id as a tie breaker so
/// every replica agrees on the order of equal keys.
pub fn render_order(a: &ShapeRecord, b: &ShapeRecord) -> std::cmp::Ordering {
    a.z.total_cmp(&b.z).then_with(|| a.id().cmp(&b.id()))
}

/// Encode a record as a map value. Records are JSON strings so that a key
/// holds exactly one opaque value and concurrent writes resolve per key.
pub fn encode<T: Serialize>(record: &T) -> Result<LoroValue, CrdtError> {
    let json = serde_json::to_string(record)?;
    Ok(LoroValue::from(json))
}

/// Decode a map value written by [`encode`].
pub fn decode<T: DeserializeOwned>(value: &LoroValue) -> Result<T, CrdtError> {
    match value {
        LoroValue::String(json) => Ok(serde_json::from_str(&json.to_string())?),
        _ => Err(CrdtError::UnexpectedValue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shapes::{Ellipse, Rectangle};
    use kurbo::Point;

    #[test]
    fn test_encode_decode() {
        let record = ShapeRecord::new(
            Shape::Rectangle(Rectangle::new(Point::new(1.0, 2.0), 30.0, 40.0)),
            3.0,
        );
        let value = encode(&record).unwrap();
        let back: ShapeRecord = decode(&value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_decode_rejects_non_string() {
        let result: Result<ShapeRecord, _> = decode(&LoroValue::from(42i64));
        assert!(matches!(result, Err(CrdtError::UnexpectedValue)));
    }

    #[test]
    fn test_render_order_breaks_ties_by_id() {
        let a = ShapeRecord::new(Shape::Ellipse(Ellipse::circle(Point::ZERO, 1.0)), 1.0);
        let b = ShapeRecord::new(Shape::Ellipse(Ellipse::circle(Point::ZERO, 1.0)), 1.0);
        let expected = a.id().cmp(&b.id());
        assert_eq!(render_order(&a, &b), expected);

        let front = ShapeRecord::new(a.shape.clone(), 2.0);
        assert_eq!(render_order(&b, &front), std::cmp::Ordering::Less);
    }
}
