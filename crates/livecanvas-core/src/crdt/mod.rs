//! CRDT integration using Loro for collaborative editing.
//!
//! This module provides the replicated shared map every client edits.
//!
//! # Schema
//!
//! The Loro document has the following structure:
//! ```text
//! LoroDoc
//! ├── "shapes": LoroMap<ShapeId, String>   (JSON ShapeRecord)
//! └── "threads": LoroMap<ThreadId, String> (JSON CommentThread)
//! ```
//!
//! Each value is a single JSON string, so a concurrent write to the same key
//! resolves to one whole record on every replica. A shape record carries its
//! own z-order key; see [`ShapeRecord`].

mod record;
mod schema;

pub use record::{decode, encode, render_order, ShapeRecord};
pub use schema::{SharedStorage, SHAPES_KEY, THREADS_KEY};

// Re-export Loro types that may be useful for collaboration
pub use loro::{ExportMode, VersionVector};

/// Errors raised by the shared storage.
#[derive(Debug, thiserror::Error)]
pub enum CrdtError {
    #[error("loro error: {0}")]
    Loro(#[from] loro::LoroError),
    #[error("export failed: {0}")]
    Encode(String),
    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("map value is not a record")]
    UnexpectedValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comments::CommentThread;
    use crate::shapes::{Ellipse, Rectangle, SerializableColor, Shape, ShapeStyle};
    use kurbo::Point;

    fn rect_at(x: f64) -> Shape {
        Shape::Rectangle(Rectangle::new(Point::new(x, 0.0), 50.0, 50.0))
    }

    fn add(doc: &mut SharedStorage, shape: Shape) -> ShapeRecord {
        let record = ShapeRecord::new(shape, doc.next_z());
        doc.upsert_shape(&record).expect("Failed to add shape");
        record
    }

    fn ids(doc: &SharedStorage) -> Vec<String> {
        doc.shape_records()
            .iter()
            .map(|r| r.id().to_string())
            .collect()
    }

    #[test]
    fn test_storage_creation() {
        let doc = SharedStorage::new();
        assert_eq!(doc.shape_count(), 0);
        assert_eq!(doc.next_z(), 0.0);
    }

    #[test]
    fn test_roundtrip_rectangle() {
        let mut doc = SharedStorage::new();

        let mut rect = Rectangle::new(Point::new(100.0, 200.0), 150.0, 80.0);
        rect.corner_radius = 16.0;
        rect.style = ShapeStyle {
            stroke_color: SerializableColor::new(255, 0, 0, 255),
            stroke_width: 3.0,
            fill_color: Some(SerializableColor::new(0, 255, 0, 128)),
            opacity: 0.5,
        };
        let original = Shape::Rectangle(rect);
        let id = original.id();
        add(&mut doc, original.clone());

        let recovered = doc.get_shape(id).expect("Shape not found");
        assert_eq!(recovered.shape, original);
    }

    #[test]
    fn test_new_shapes_stack_on_top() {
        let mut doc = SharedStorage::new();
        let a = add(&mut doc, rect_at(0.0));
        let b = add(&mut doc, rect_at(10.0));
        assert!(b.z > a.z);
        assert_eq!(ids(&doc), vec![a.id().to_string(), b.id().to_string()]);
    }

    #[test]
    fn test_delete_shape() {
        let mut doc = SharedStorage::new();
        let record = add(&mut doc, rect_at(0.0));
        assert!(doc.delete_shape(record.id()).unwrap());
        assert_eq!(doc.shape_count(), 0);
        assert!(!doc.delete_shape(record.id()).unwrap());
    }

    #[test]
    fn test_z_order_manipulation() {
        let mut doc = SharedStorage::new();
        let a = add(&mut doc, rect_at(0.0)).id();
        let b = add(&mut doc, rect_at(10.0)).id();
        let c = add(&mut doc, rect_at(20.0)).id();

        assert!(doc.bring_to_front(a).unwrap());
        assert_eq!(doc.shapes_ordered().last().map(|s| s.id()), Some(a));
        assert!(!doc.bring_to_front(a).unwrap());

        assert!(doc.send_to_back(a).unwrap());
        assert_eq!(doc.shapes_ordered().first().map(|s| s.id()), Some(a));

        assert!(doc.bring_forward(a).unwrap());
        let order: Vec<_> = doc.shapes_ordered().iter().map(|s| s.id()).collect();
        assert_eq!(order, vec![b, a, c]);

        assert!(doc.send_backward(c).unwrap());
        let order: Vec<_> = doc.shapes_ordered().iter().map(|s| s.id()).collect();
        assert_eq!(order, vec![b, c, a]);

        assert!(!doc.send_backward(b).unwrap());
        assert!(!doc.bring_forward(a).unwrap());
    }

    #[test]
    fn test_swap_equal_keys() {
        let mut doc = SharedStorage::new();
        let a = ShapeRecord::new(rect_at(0.0), 1.0);
        let b = ShapeRecord::new(rect_at(10.0), 1.0);
        doc.upsert_shape(&a).unwrap();
        doc.upsert_shape(&b).unwrap();
        let before = ids(&doc);

        let bottom = doc.shape_records()[0].id();
        assert!(doc.bring_forward(bottom).unwrap());
        let after = ids(&doc);
        assert_eq!(after, vec![before[1].clone(), before[0].clone()]);
    }

    #[test]
    fn test_reorder_within_tied_run_moves_one_layer() {
        let mut doc = SharedStorage::new();
        for x in [0.0, 10.0, 20.0, 30.0] {
            doc.upsert_shape(&ShapeRecord::new(rect_at(x), 1.0)).unwrap();
        }
        let top = ShapeRecord::new(rect_at(40.0), 2.0);
        doc.upsert_shape(&top).unwrap();
        let before = ids(&doc);

        let bottom = doc.shape_records()[0].id();
        assert!(doc.bring_forward(bottom).unwrap());
        let after = ids(&doc);
        assert_eq!(
            after,
            vec![
                before[1].clone(),
                before[0].clone(),
                before[2].clone(),
                before[3].clone(),
                before[4].clone(),
            ]
        );
        assert!(doc.shape_records().iter().all(|r| r.z < 2.0 || r.id() == top.id()));

        let third = doc.shape_records()[2].id();
        assert!(doc.send_backward(third).unwrap());
        let after = ids(&doc);
        assert_eq!(
            after,
            vec![
                before[1].clone(),
                before[2].clone(),
                before[0].clone(),
                before[3].clone(),
                before[4].clone(),
            ]
        );
    }

    #[test]
    fn test_clear_shapes() {
        let mut doc = SharedStorage::new();
        add(&mut doc, rect_at(0.0));
        add(&mut doc, Shape::Ellipse(Ellipse::circle(Point::ZERO, 4.0)));
        assert_eq!(doc.clear_shapes().unwrap(), 2);
        assert_eq!(doc.shape_count(), 0);
    }

    #[test]
    fn test_export_import() {
        let mut doc = SharedStorage::new();
        add(&mut doc, rect_at(10.0));

        let bytes = doc.export_snapshot().unwrap();
        let doc2 = SharedStorage::from_snapshot(&bytes).expect("Failed to import");
        assert_eq!(doc2.shape_count(), 1);
    }

    #[test]
    fn test_import_reports_change() {
        let mut a = SharedStorage::new();
        let mut b = SharedStorage::new();
        add(&mut a, rect_at(0.0));

        let update = a.export_updates(&b.version()).unwrap();
        assert!(b.import(&update).unwrap());
        // Second delivery of the same update is a no-op.
        assert!(!b.import(&update).unwrap());
        assert_eq!(b.shape_count(), 1);
    }

    #[test]
    fn test_import_garbage_fails() {
        let mut doc = SharedStorage::new();
        assert!(doc.import(b"not a loro blob").is_err());
    }

    #[test]
    fn test_concurrent_writes_converge() {
        let mut a = SharedStorage::new();
        let mut b = SharedStorage::new();
        let base = add(&mut a, rect_at(0.0));
        b.import(&a.export_snapshot().unwrap()).unwrap();

        let mut left = base.clone();
        left.shape.transform(kurbo::Affine::translate((5.0, 0.0)));
        let mut right = base.clone();
        right.shape.transform(kurbo::Affine::translate((0.0, 9.0)));
        a.upsert_shape(&left).unwrap();
        b.upsert_shape(&right).unwrap();

        let from_a = a.export_updates(&b.version()).unwrap();
        let from_b = b.export_updates(&a.version()).unwrap();
        a.import(&from_b).unwrap();
        b.import(&from_a).unwrap();

        let winner_a = a.get_shape(base.id()).unwrap();
        let winner_b = b.get_shape(base.id()).unwrap();
        assert_eq!(winner_a, winner_b);
        assert!(winner_a == left || winner_a == right);
    }

    #[test]
    fn test_threads_roundtrip() {
        let mut doc = SharedStorage::new();
        let thread = CommentThread::new(Point::new(3.0, 4.0), 0);
        doc.upsert_thread(&thread).unwrap();
        assert_eq!(doc.get_thread(thread.id), Some(thread.clone()));
        assert_eq!(doc.threads().len(), 1);
        assert!(doc.delete_thread(thread.id).unwrap());
        assert!(doc.threads().is_empty());
    }

    #[test]
    fn test_undo_add_shape() {
        let mut doc = SharedStorage::new();
        add(&mut doc, rect_at(100.0));

        assert_eq!(doc.shape_count(), 1);
        assert!(doc.can_undo());

        // Undo should remove the shape
        assert!(doc.undo());
        assert_eq!(doc.shape_count(), 0);
        assert!(doc.can_redo());

        // Redo should restore it
        assert!(doc.redo());
        assert_eq!(doc.shape_count(), 1);
    }

    #[test]
    fn test_undo_delete_shape() {
        let mut doc = SharedStorage::new();
        let record = add(&mut doc, rect_at(0.0));

        // Clear undo history so we only track the delete
        doc.clear_undo_history();

        doc.delete_shape(record.id()).unwrap();
        assert_eq!(doc.shape_count(), 0);

        assert!(doc.undo());
        assert_eq!(doc.get_shape(record.id()), Some(record));
    }

    #[test]
    fn test_undo_with_empty_history() {
        let mut doc = SharedStorage::new();
        assert!(!doc.undo());
        assert!(!doc.redo());
    }

    #[test]
    fn test_undo_group() {
        let mut doc = SharedStorage::new();
        doc.start_undo_group();
        add(&mut doc, rect_at(0.0));
        add(&mut doc, rect_at(10.0));
        doc.end_undo_group();

        assert!(doc.undo());
        assert_eq!(doc.shape_count(), 0);
    }

    #[test]
    fn test_second_group_start_is_ignored() {
        let mut doc = SharedStorage::new();
        doc.start_undo_group();
        doc.start_undo_group();
        add(&mut doc, rect_at(0.0));
        add(&mut doc, rect_at(10.0));
        doc.end_undo_group();

        assert!(doc.undo());
        assert_eq!(doc.shape_count(), 0);
        assert!(doc.redo());
        assert_eq!(doc.shape_count(), 2);
    }

    #[test]
    fn test_remote_changes_are_not_undone() {
        let mut a = SharedStorage::new();
        let mut b = SharedStorage::new();
        add(&mut a, rect_at(0.0));
        b.import(&a.export_snapshot().unwrap()).unwrap();

        assert!(!b.undo());
        assert_eq!(b.shape_count(), 1);
    }
}
