//! File store abstraction consumed by the vault.
//!
//! The vault core never decides directory layout. It reads, writes and walks
//! notes through a [`NoteStore`], so hosts can substitute their own storage.

use std::{
    fs,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, instrument, trace};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error at {path:?}: {source}")]
    Io {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    #[error("Atomic write of {path:?} failed: {reason}")]
    AtomicWriteFailed { reason: String, path: PathBuf },

    #[error("Failed to walk {root:?}: {source}")]
    Walk {
        #[source]
        source: walkdir::Error,
        root: PathBuf,
    },
}

impl StoreError {
    pub fn io(source: io::Error, path: impl Into<PathBuf>) -> Self {
        StoreError::Io {
            source,
            path: path.into(),
        }
    }

    /// Whether the error is an IO "not found".
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Name prefix of the temp files [`LocalNoteStore`] writes before renaming.
pub const TEMP_FILE_PREFIX: &str = ".notevault-tmp-";

/// Random characters appended to [`TEMP_FILE_PREFIX`].
pub const TEMP_FILE_RAND_LEN: usize = 6;

/// Whether `name` is a temp file left behind by an interrupted atomic write.
pub fn is_temp_file_name(name: &str) -> bool {
    name.strip_prefix(TEMP_FILE_PREFIX).is_some_and(|rest| {
        rest.len() == TEMP_FILE_RAND_LEN && rest.bytes().all(|b| b.is_ascii_alphanumeric())
    })
}

/// Storage primitives the vault depends on.
pub trait NoteStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError>;

    /// At most the first `len` bytes at `path`.
    fn read_prefix(&self, path: &Path, len: usize) -> Result<Vec<u8>, StoreError> {
        let mut bytes = self.read(path)?;
        bytes.truncate(len);
        Ok(bytes)
    }

    /// Replace the content at `path`. Readers must never observe a partial write.
    fn write(&self, path: &Path, content: &[u8]) -> Result<(), StoreError>;

    /// All regular files below `root`, in a stable order.
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, StoreError>;

    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> Result<(), StoreError>;

    /// Read a note as UTF-8 text, replacing invalid sequences.
    fn read_string(&self, path: &Path) -> Result<String, StoreError> {
        let bytes = self.read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// [`NoteStore`] backed by the local filesystem.
///
/// Writes go to a temp file in the destination directory that is then renamed
/// over the target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalNoteStore;

impl LocalNoteStore {
    pub fn new() -> Self {
        Self
    }
}

/// Write `content` to `path` via a temp file in the same directory.
pub(crate) fn atomic_write(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    // Same directory keeps the rename on one filesystem
    let mut temp_file = tempfile::Builder::new()
        .prefix(TEMP_FILE_PREFIX)
        .rand_bytes(TEMP_FILE_RAND_LEN)
        .tempfile_in(parent)
        .map_err(|e| StoreError::io(e, parent))?;
    temp_file
        .write_all(content)
        .and_then(|()| temp_file.as_file().sync_all())
        .map_err(|e| StoreError::io(e, temp_file.path()))?;
    temp_file
        .persist(path)
        .map_err(|e| StoreError::AtomicWriteFailed {
            reason: format!("Failed to persist temp file: {e}"),
            path: path.to_path_buf(),
        })?;

    Ok(())
}

impl NoteStore for LocalNoteStore {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        fs::read(path).map_err(|e| StoreError::io(e, path))
    }

    fn read_prefix(&self, path: &Path, len: usize) -> Result<Vec<u8>, StoreError> {
        let file = fs::File::open(path).map_err(|e| StoreError::io(e, path))?;
        let mut head = Vec::with_capacity(len);
        file.take(len as u64)
            .read_to_end(&mut head)
            .map_err(|e| StoreError::io(e, path))?;
        Ok(head)
    }

    #[instrument(level = "trace", skip(self, content), fields(len = content.len()))]
    fn write(&self, path: &Path, content: &[u8]) -> Result<(), StoreError> {
        atomic_write(path, content)
    }

    #[instrument(level = "debug", skip(self))]
    fn walk(&self, root: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = entry.map_err(|source| StoreError::Walk {
                source,
                root: root.to_path_buf(),
            })?;
            if entry.file_type().is_file() {
                trace!(path = %entry.path().display(), "Found file");
                files.push(entry.into_path());
            }
        }
        debug!(count = files.len(), "Walk complete");
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> Result<(), StoreError> {
        fs::remove_file(path).map_err(|e| StoreError::io(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalNoteStore::new();
        let path = dir.path().join("note.md");

        store.write(&path, b"first").unwrap();
        store.write(&path, b"second").unwrap();
        assert_eq!(store.read(&path).unwrap(), b"second");
        assert_eq!(store.read_string(&path).unwrap(), "second");

        // No temp files left behind
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_walk_lists_regular_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalNoteStore::new();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("z.md"), b"z").unwrap();
        fs::write(dir.path().join("a.md"), b"a").unwrap();
        fs::write(dir.path().join("b/nested/c.md"), b"c").unwrap();

        let files = store.walk(dir.path()).unwrap();
        let relative: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            relative,
            vec![
                PathBuf::from("a.md"),
                PathBuf::from("b/nested/c.md"),
                PathBuf::from("z.md"),
            ]
        );
    }

    #[test]
    fn test_walk_missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = LocalNoteStore::new().walk(&dir.path().join("missing"));
        assert!(matches!(result, Err(StoreError::Walk { .. })));
    }

    #[test]
    fn test_exists_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalNoteStore::new();
        let path = dir.path().join("gone.md");
        assert!(!store.exists(&path));
        store.write(&path, b"x").unwrap();
        assert!(store.exists(&path));
        store.remove(&path).unwrap();
        assert!(!store.exists(&path));
        assert!(store.read(&path).unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalNoteStore::new();
        let path = dir.path().join("long.md");
        store.write(&path, b"0123456789").unwrap();
        assert_eq!(store.read_prefix(&path, 4).unwrap(), b"0123");
        assert_eq!(store.read_prefix(&path, 64).unwrap(), b"0123456789");
        assert!(
            store
                .read_prefix(&dir.path().join("missing.md"), 4)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn test_temp_file_names() {
        assert!(is_temp_file_name(".notevault-tmp-aB3xZ9"));
        assert!(!is_temp_file_name(".notevault-tmp-aB3xZ"));
        assert!(!is_temp_file_name(".notevault-tmp-ideas.md"));
        assert!(!is_temp_file_name(".tmpAbC123"));
        assert!(!is_temp_file_name(".tmp-ideas.md"));
    }
}
