//! File-based storage implementation.

use super::{BoxFuture, Storage, StorageError, StorageResult};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fs;
use std::path::{Path, PathBuf};

/// Snapshot file extension.
const EXTENSION: &str = "loro";

/// Bytes escaped in file names. `%` is escaped too, so the mapping is reversible.
const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// File-based storage.
///
/// Stores each room snapshot as `<percent-encoded id>.loro` in a base directory.
pub struct FileStorage {
    /// Base directory for snapshot files.
    base_path: PathBuf,
}

impl FileStorage {
    /// Create a new file storage with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Create file storage in the default location.
    ///
    /// On Unix: `~/.local/share/livecanvas/rooms/`
    /// On Windows: `%LOCALAPPDATA%\livecanvas\rooms\`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("livecanvas").join("rooms"))
    }

    /// Get the file path for a room ID.
    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", encode_id(id), EXTENSION))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Percent-encode everything except ASCII letters, digits, `-` and `_`.
fn encode_id(id: &str) -> String {
    utf8_percent_encode(id, FILE_NAME).to_string()
}

fn decode_id(stem: &str) -> Option<String> {
    percent_decode_str(stem)
        .decode_utf8()
        .ok()
        .map(|id| id.into_owned())
}

impl Storage for FileStorage {
    fn save(&self, id: &str, snapshot: &[u8]) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);
        let snapshot = snapshot.to_vec();

        Box::pin(async move {
            // Replace atomically via a sibling temp file.
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, &snapshot).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", tmp.display(), e))
            })?;
            fs::rename(&tmp, &path).map_err(|e| {
                StorageError::Io(format!("Failed to replace {}: {}", path.display(), e))
            })
        })
    }

    fn load(&self, id: &str) -> BoxFuture<'_, StorageResult<Vec<u8>>> {
        let path = self.snapshot_path(id);
        let id_owned = id.to_string();

        Box::pin(async move {
            if !path.exists() {
                return Err(StorageError::NotFound(id_owned));
            }
            fs::read(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read {}: {}", path.display(), e))
            })
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(id);

        Box::pin(async move {
            if path.exists() {
                fs::remove_file(&path).map_err(|e| {
                    StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        let base = self.base_path.clone();

        Box::pin(async move {
            if !base.exists() {
                return Ok(vec![]);
            }

            let entries = fs::read_dir(&base)
                .map_err(|e| StorageError::Io(format!("Failed to read directory: {}", e)))?;

            let mut ids = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|e| e == EXTENSION) {
                    match path.file_stem().and_then(|s| s.to_str()).and_then(decode_id) {
                        Some(id) => ids.push(id),
                        None => log::warn!("Skipping snapshot with unreadable name: {}", path.display()),
                    }
                }
            }
            Ok(ids)
        })
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let path = self.snapshot_path(id);
        Box::pin(async move { Ok(path.exists()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{ShapeRecord, SharedStorage};
    use crate::shapes::{Rectangle, Shape};
    use crate::storage::block_on;
    use kurbo::Point;
    use tempfile::tempdir;

    #[test]
    fn test_file_storage_save_load_snapshot() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let mut doc = SharedStorage::new();
        let shape = Shape::Rectangle(Rectangle::new(Point::ZERO, 10.0, 20.0));
        doc.upsert_shape(&ShapeRecord::new(shape.clone(), 0.0)).unwrap();

        block_on(storage.save("room-1", &doc.export_snapshot().unwrap())).unwrap();
        assert!(dir.path().join("room-1.loro").exists());

        let bytes = block_on(storage.load("room-1")).unwrap();
        let restored = SharedStorage::from_snapshot(&bytes).unwrap();
        assert_eq!(restored.get_shape(shape.id()).unwrap().shape, shape);
    }

    #[test]
    fn test_file_storage_not_found() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        let result = block_on(storage.load("nonexistent"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_file_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let storage = FileStorage::new(nested.clone()).unwrap();
        assert_eq!(storage.base_path(), nested.as_path());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_file_storage_list_ignores_other_files() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.save("room1", b"1")).unwrap();
        block_on(storage.save("room2", b"2")).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let mut list = block_on(storage.list()).unwrap();
        list.sort();
        assert_eq!(list, vec!["room1".to_string(), "room2".to_string()]);
    }

    #[test]
    fn test_file_storage_delete() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.save("room", b"x")).unwrap();
        assert!(block_on(storage.exists("room")).unwrap());

        block_on(storage.delete("room")).unwrap();
        assert!(!block_on(storage.exists("room")).unwrap());
    }

    #[test]
    fn test_file_storage_encodes_id() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.save("../team/room:1", b"data")).unwrap();
        assert!(dir.path().join("%2E%2E%2Fteam%2Froom%3A1.loro").exists());
        assert_eq!(block_on(storage.load("../team/room:1")).unwrap(), b"data");
        assert_eq!(
            block_on(storage.list()).unwrap(),
            vec!["../team/room:1".to_string()]
        );
    }

    #[test]
    fn test_file_storage_distinct_ids_do_not_collide() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.save("team/a", b"room-one")).unwrap();
        block_on(storage.save("team_a", b"room-two")).unwrap();
        block_on(storage.save("team%2Fa", b"room-three")).unwrap();

        assert_eq!(block_on(storage.load("team/a")).unwrap(), b"room-one");
        assert_eq!(block_on(storage.load("team_a")).unwrap(), b"room-two");
        assert_eq!(block_on(storage.load("team%2Fa")).unwrap(), b"room-three");

        let mut list = block_on(storage.list()).unwrap();
        list.sort();
        assert_eq!(list, vec!["team%2Fa", "team/a", "team_a"]);
    }
}
