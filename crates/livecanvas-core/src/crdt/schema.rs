//! Loro document schema and operations.

use loro::{ExportMode, LoroDoc, LoroMap, LoroValue, UndoManager, ValueOrContainer, VersionVector};

use super::record::{decode, encode, render_order, ShapeRecord};
use super::CrdtError;
use crate::comments::{CommentThread, ThreadId};
use crate::shapes::{Shape, ShapeId};

/// Key for the shapes map in the document.
pub const SHAPES_KEY: &str = "shapes";
/// Key for the comment threads map in the document.
pub const THREADS_KEY: &str = "threads";

const MAX_UNDO_STEPS: usize = 100;
/// Edits within this many milliseconds merge into one undo step.
const UNDO_MERGE_INTERVAL_MS: i64 = 300;

/// The replicated shared map.
///
/// Wraps a `LoroDoc` and provides a high-level API over its two root maps.
/// Every value is an opaque JSON record, so concurrent writes to the same
/// key resolve as last-writer-wins. Also owns an `UndoManager` that only
/// tracks changes made by this peer.
pub struct SharedStorage {
    doc: LoroDoc,
    undo_manager: UndoManager,
}

impl SharedStorage {
    /// Create a new empty storage.
    pub fn new() -> Self {
        Self::with_doc(LoroDoc::new())
    }

    /// Create a storage from a snapshot or update blob.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, CrdtError> {
        let doc = LoroDoc::new();
        doc.import(bytes)?;
        Ok(Self::with_doc(doc))
    }

    fn with_doc(doc: LoroDoc) -> Self {
        let mut undo_manager = UndoManager::new(&doc);
        undo_manager.set_max_undo_steps(MAX_UNDO_STEPS);
        undo_manager.set_merge_interval(UNDO_MERGE_INTERVAL_MS);
        Self { doc, undo_manager }
    }

    /// Get the underlying LoroDoc.
    pub fn loro_doc(&self) -> &LoroDoc {
        &self.doc
    }

    /// Peer ID of this replica.
    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    fn shapes_map(&self) -> LoroMap {
        self.doc.get_map(SHAPES_KEY)
    }

    fn threads_map(&self) -> LoroMap {
        self.doc.get_map(THREADS_KEY)
    }

    // --- Shapes ---

    /// Number of shape records.
    pub fn shape_count(&self) -> usize {
        self.shapes_map().len()
    }

    /// Insert or overwrite the record stored under the record's shape id.
    pub fn upsert_shape(&mut self, record: &ShapeRecord) -> Result<(), CrdtError> {
        let id = record.id().to_string();
        self.shapes_map().insert(&id, encode(record)?)?;
        self.doc.commit();
        Ok(())
    }

    /// Delete a shape record. Returns false if there was no such record.
    pub fn delete_shape(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let shapes = self.shapes_map();
        let key = id.to_string();
        if shapes.get(&key).is_none() {
            return Ok(false);
        }
        shapes.delete(&key)?;
        self.doc.commit();
        Ok(true)
    }

    /// Get a shape record by id.
    pub fn get_shape(&self, id: ShapeId) -> Option<ShapeRecord> {
        match self.shapes_map().get(&id.to_string())? {
            ValueOrContainer::Value(value) => decode_logged(&value),
            ValueOrContainer::Container(_) => None,
        }
    }

    /// All shape records in render order (back to front).
    pub fn shape_records(&self) -> Vec<ShapeRecord> {
        let mut records: Vec<ShapeRecord> = map_values(&self.shapes_map())
            .iter()
            .filter_map(decode_logged)
            .collect();
        records.sort_by(render_order);
        records
    }

    /// All shapes in render order.
    pub fn shapes_ordered(&self) -> Vec<Shape> {
        self.shape_records().into_iter().map(|r| r.shape).collect()
    }

    /// Delete every shape record in one commit. Returns how many were removed.
    pub fn clear_shapes(&mut self) -> Result<usize, CrdtError> {
        let shapes = self.shapes_map();
        let keys = map_keys(&shapes);
        for key in &keys {
            shapes.delete(key)?;
        }
        self.doc.commit();
        Ok(keys.len())
    }

    // --- Z-order ---

    /// Z key for a shape placed on top of everything.
    pub fn next_z(&self) -> f64 {
        self.shape_records()
            .last()
            .map(|r| r.z.floor() + 1.0)
            .unwrap_or(0.0)
    }

    /// Rewrite a record's z key. Returns false if the shape does not exist.
    fn set_z(&mut self, id: ShapeId, z: f64) -> Result<bool, CrdtError> {
        match self.get_shape(id) {
            Some(mut record) => {
                record.z = z;
                self.upsert_shape(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Bring a shape to the front (top of z-order).
    pub fn bring_to_front(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let records = self.shape_records();
        match records.last() {
            Some(top) if top.id() == id => Ok(false),
            Some(top) => {
                let z = top.z.floor() + 1.0;
                self.set_z(id, z)
            }
            None => Ok(false),
        }
    }

    /// Send a shape to the back (bottom of z-order).
    pub fn send_to_back(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let records = self.shape_records();
        match records.first() {
            Some(bottom) if bottom.id() == id => Ok(false),
            Some(bottom) => {
                let z = bottom.z.ceil() - 1.0;
                self.set_z(id, z)
            }
            None => Ok(false),
        }
    }

    /// Move a shape one layer forward by swapping keys with its neighbour.
    /// Returns false if it is already at the front.
    pub fn bring_forward(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let records = self.shape_records();
        let Some(pos) = records.iter().position(|r| r.id() == id) else {
            return Ok(false);
        };
        if pos + 1 >= records.len() {
            return Ok(false);
        }
        self.swap_z(records, pos, pos + 1)
    }

    /// Move a shape one layer backward by swapping keys with its neighbour.
    /// Returns false if it is already at the back.
    pub fn send_backward(&mut self, id: ShapeId) -> Result<bool, CrdtError> {
        let records = self.shape_records();
        let Some(pos) = records.iter().position(|r| r.id() == id) else {
            return Ok(false);
        };
        if pos == 0 {
            return Ok(false);
        }
        self.swap_z(records, pos, pos - 1)
    }

    /// Swap the keys of two adjacent records. A run of equal keys is first
    /// spread out so the swap moves the shape by exactly one layer.
    fn swap_z(
        &mut self,
        mut records: Vec<ShapeRecord>,
        a: usize,
        b: usize,
    ) -> Result<bool, CrdtError> {
        let mut changed = vec![a, b];
        if records[a].z == records[b].z {
            changed.extend(spread_ties(&mut records, a));
        }
        let z = records[a].z;
        records[a].z = records[b].z;
        records[b].z = z;

        changed.sort_unstable();
        changed.dedup();
        let shapes = self.shapes_map();
        for i in changed {
            let record = &records[i];
            shapes.insert(&record.id().to_string(), encode(record)?)?;
        }
        self.doc.commit();
        Ok(true)
    }

    // --- Comment threads ---

    /// Insert or overwrite a comment thread.
    pub fn upsert_thread(&mut self, thread: &CommentThread) -> Result<(), CrdtError> {
        self.threads_map()
            .insert(&thread.id.to_string(), encode(thread)?)?;
        self.doc.commit();
        Ok(())
    }

    /// Delete a thread. Returns false if there was no such thread.
    pub fn delete_thread(&mut self, id: ThreadId) -> Result<bool, CrdtError> {
        let threads = self.threads_map();
        let key = id.to_string();
        if threads.get(&key).is_none() {
            return Ok(false);
        }
        threads.delete(&key)?;
        self.doc.commit();
        Ok(true)
    }

    pub fn get_thread(&self, id: ThreadId) -> Option<CommentThread> {
        match self.threads_map().get(&id.to_string())? {
            ValueOrContainer::Value(value) => decode_logged(&value),
            ValueOrContainer::Container(_) => None,
        }
    }

    /// All threads, unordered.
    pub fn threads(&self) -> Vec<CommentThread> {
        map_values(&self.threads_map())
            .iter()
            .filter_map(decode_logged)
            .collect()
    }

    // --- Replication ---

    /// Export the document as a snapshot (full state).
    pub fn export_snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Export incremental updates since a version.
    pub fn export_updates(&self, since: &VersionVector) -> Result<Vec<u8>, CrdtError> {
        self.doc
            .export(ExportMode::updates(since))
            .map_err(|e| CrdtError::Encode(e.to_string()))
    }

    /// Import a snapshot or updates from another replica.
    /// Returns true if the import changed this replica.
    pub fn import(&mut self, bytes: &[u8]) -> Result<bool, CrdtError> {
        let before = self.version();
        self.doc.import(bytes)?;
        Ok(self.version() != before)
    }

    /// Get the current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    // --- Undo/Redo ---

    /// Undo the last change made by this peer.
    /// Returns true if undo was performed, false if nothing to undo.
    pub fn undo(&mut self) -> bool {
        match self.undo_manager.undo() {
            Ok(done) => done,
            Err(e) => {
                log::warn!("Undo failed: {}", e);
                false
            }
        }
    }

    /// Redo the last undone change.
    pub fn redo(&mut self) -> bool {
        match self.undo_manager.redo() {
            Ok(done) => done,
            Err(e) => {
                log::warn!("Redo failed: {}", e);
                false
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        self.undo_manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo_manager.can_redo()
    }

    /// Start a new undo group. All changes until `end_undo_group` will be undone together.
    pub fn start_undo_group(&mut self) {
        if let Err(e) = self.undo_manager.group_start() {
            log::warn!("Could not start undo group: {}", e);
        }
    }

    pub fn end_undo_group(&mut self) {
        self.undo_manager.group_end();
    }

    pub fn clear_undo_history(&self) {
        self.undo_manager.clear();
    }
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_logged<T: serde::de::DeserializeOwned>(value: &LoroValue) -> Option<T> {
    match decode(value) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Skipping unreadable record: {}", e);
            None
        }
    }
}

/// Give the run of records sharing `records[idx].z` distinct increasing keys,
/// all below the next key up. `records` must be in render order. Returns the
/// indices that were rewritten.
fn spread_ties(records: &mut [ShapeRecord], idx: usize) -> Vec<usize> {
    let z = records[idx].z;
    let start = records[..idx]
        .iter()
        .rposition(|r| r.z != z)
        .map_or(0, |i| i + 1);
    let end = records[idx..]
        .iter()
        .position(|r| r.z != z)
        .map_or(records.len(), |i| idx + i);
    let upper = records.get(end).map_or(z + 1.0, |r| r.z);
    let step = (upper - z) / (end - start) as f64;
    for (i, record) in records[start..end].iter_mut().enumerate() {
        record.z = z + step * i as f64;
    }
    (start..end).collect()
}

fn map_values(map: &LoroMap) -> Vec<LoroValue> {
    match map.get_deep_value() {
        LoroValue::Map(entries) => entries.values().cloned().collect(),
        _ => Vec::new(),
    }
}

fn map_keys(map: &LoroMap) -> Vec<String> {
    match map.get_deep_value() {
        LoroValue::Map(entries) => entries.keys().cloned().collect(),
        _ => Vec::new(),
    }
}
