//! Enrolled-identity gallery and its JSON persistence.
//!
//! The file is a single JSON object mapping staff identifier to embedding
//! array, rewritten wholesale after each change. Entries are kept sorted by
//! identity so scan order (and therefore tie-breaking) is reproducible
//! across restarts.

use crate::types::Embedding;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("gallery file {path} is malformed: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("embedding for {identity:?} has dimension {actual}, gallery uses {expected}")]
    DimensionMismatch {
        identity: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity must not be empty")]
    EmptyIdentity,
}

/// Borrowed view of one enrolled identity.
#[derive(Debug, Clone, Copy)]
pub struct GalleryEntry<'a> {
    pub identity: &'a str,
    pub embedding: &'a Embedding,
}

/// In-memory identity → reference embedding mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gallery {
    entries: BTreeMap<String, Embedding>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimension shared by every entry, `None` while empty.
    pub fn dim(&self) -> Option<usize> {
        self.entries.values().next().map(Embedding::dim)
    }

    pub fn get(&self, identity: &str) -> Option<&Embedding> {
        self.entries.get(identity)
    }

    /// Insert or overwrite. Returns the embedding previously stored for `identity`.
    pub fn put(&mut self, identity: &str, embedding: Embedding) -> Result<Option<Embedding>, GalleryError> {
        if identity.is_empty() {
            return Err(GalleryError::EmptyIdentity);
        }
        // The entry being replaced does not constrain the dimension.
        let others = self.entries.iter().find(|(id, _)| id.as_str() != identity);
        if let Some((_, existing)) = others {
            if existing.dim() != embedding.dim() {
                return Err(GalleryError::DimensionMismatch {
                    identity: identity.to_string(),
                    expected: existing.dim(),
                    actual: embedding.dim(),
                });
            }
        }
        Ok(self.entries.insert(identity.to_string(), embedding))
    }

    /// Entries in identity order.
    pub fn entries(&self) -> impl Iterator<Item = GalleryEntry<'_>> {
        self.entries.iter().map(|(identity, embedding)| GalleryEntry { identity, embedding })
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn validate(&self) -> Result<(), GalleryError> {
        let Some(expected) = self.dim() else {
            return Ok(());
        };
        for entry in self.entries() {
            if entry.identity.is_empty() {
                return Err(GalleryError::EmptyIdentity);
            }
            if entry.embedding.dim() != expected {
                return Err(GalleryError::DimensionMismatch {
                    identity: entry.identity.to_string(),
                    expected,
                    actual: entry.embedding.dim(),
                });
            }
        }
        Ok(())
    }
}

/// Gallery owned together with its backing file.
///
/// Readers take an `Arc` snapshot and never wait on disk I/O. Writers are
/// serialized; a write builds a new gallery, persists it, and only then
/// publishes it as the current snapshot.
pub struct GalleryStore {
    path: PathBuf,
    current: RwLock<Arc<Gallery>>,
    writer: Mutex<()>,
}

impl GalleryStore {
    /// Open the store at `path`, loading any persisted state.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, GalleryError> {
        let path = path.into();
        let gallery = Self::load(&path)?;
        tracing::info!(path = %path.display(), entries = gallery.len(), "gallery loaded");
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(gallery)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the gallery file. A missing file is an empty gallery.
    pub fn load(path: &Path) -> Result<Gallery, GalleryError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no gallery file yet, starting empty");
                return Ok(Gallery::new());
            }
            Err(source) => {
                return Err(GalleryError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let entries: BTreeMap<String, Embedding> =
            serde_json::from_slice(&bytes).map_err(|source| GalleryError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let gallery = Gallery { entries };
        gallery.validate()?;
        Ok(gallery)
    }

    /// Replace the gallery file: write a sibling temp file, fsync, rename.
    pub fn save(path: &Path, gallery: &Gallery) -> Result<(), GalleryError> {
        let io_err = |source: io::Error| GalleryError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(&gallery.entries).map_err(|source| GalleryError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        let tmp = temp_path(path);
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(&json)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp, path)) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        tracing::debug!(path = %path.display(), entries = gallery.len(), "gallery saved");
        Ok(())
    }

    /// The current gallery. Stays consistent while later writes land.
    pub fn snapshot(&self) -> Arc<Gallery> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, identity: &str) -> Option<Embedding> {
        self.snapshot().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Store `embedding` under `identity` (last write wins) and persist.
    ///
    /// On a persistence failure the in-memory gallery is left as it was.
    pub fn put(&self, identity: &str, embedding: Embedding) -> Result<Option<Embedding>, GalleryError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();
        let previous = next.put(identity, embedding)?;
        Self::save(&self.path, &next)?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        Ok(previous)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json")).unwrap();
        assert!(store.is_empty());
        assert!(store.get("alice").is_none());
    }

    #[test]
    fn test_put_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json")).unwrap();

        assert_eq!(store.put("alice", emb(&[1.0, 0.0])).unwrap(), None);
        assert_eq!(store.put("bob", emb(&[0.0, 1.0])).unwrap(), None);
        let previous = store.put("alice", emb(&[0.6, 0.8])).unwrap();

        assert_eq!(previous, Some(emb(&[1.0, 0.0])));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("alice"), Some(emb(&[0.6, 0.8])));
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/embeddings.json");
        {
            let store = GalleryStore::open(&path).unwrap();
            store.put("carol", emb(&[0.1, 0.2, 0.3])).unwrap();
            store.put("alice", emb(&[-0.5, 0.25, 1.0e-7])).unwrap();
        }

        let reopened = GalleryStore::open(&path).unwrap();
        let snapshot = reopened.snapshot();
        let ids: Vec<&str> = snapshot.identities().collect();
        assert_eq!(ids, vec!["alice", "carol"]);
        for (id, expected) in [("alice", [-0.5f32, 0.25, 1.0e-7]), ("carol", [0.1f32, 0.2, 0.3])] {
            let got = snapshot.get(id).unwrap();
            for (a, b) in got.values.iter().zip(expected) {
                assert!((a - b).abs() <= f32::EPSILON * b.abs().max(1.0), "{id}: {a} vs {b}");
            }
        }
        assert!(!path.with_file_name("embeddings.json.tmp").exists());
    }

    #[test]
    fn test_file_format_is_plain_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path).unwrap();
        store.put("s-001", emb(&[0.5, -0.5])).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({ "s-001": [0.5, -0.5] }));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json")).unwrap();
        store.put("alice", emb(&[1.0, 0.0])).unwrap();

        let err = store.put("bob", emb(&[1.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, GalleryError::DimensionMismatch { expected: 2, actual: 3, .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sole_entry_may_change_dimension() {
        let mut gallery = Gallery::new();
        gallery.put("alice", emb(&[1.0, 0.0])).unwrap();
        gallery.put("alice", emb(&[1.0, 0.0, 0.0])).unwrap();
        assert_eq!(gallery.dim(), Some(3));
    }

    #[test]
    fn test_empty_identity_rejected() {
        let mut gallery = Gallery::new();
        assert!(matches!(gallery.put("", emb(&[1.0])), Err(GalleryError::EmptyIdentity)));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(GalleryStore::open(&path), Err(GalleryError::Json { .. })));
    }

    #[test]
    fn test_inconsistent_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, br#"{"a": [1.0, 0.0], "b": [1.0]}"#).unwrap();
        assert!(matches!(
            GalleryStore::open(&path),
            Err(GalleryError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_failed_save_keeps_memory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = GalleryStore::open(&path).unwrap();
        store.put("alice", emb(&[1.0, 0.0])).unwrap();
        let before = fs::read(&path).unwrap();

        // A directory where the temp file should go makes the write fail.
        fs::create_dir(path.with_file_name("embeddings.json.tmp")).unwrap();
        assert!(matches!(store.put("bob", emb(&[0.0, 1.0])), Err(GalleryError::Io { .. })));

        assert_eq!(store.len(), 1);
        assert!(store.get("bob").is_none());
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_snapshot_isolated_from_later_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = GalleryStore::open(dir.path().join("embeddings.json")).unwrap();
        store.put("alice", emb(&[1.0, 0.0])).unwrap();

        let snapshot = store.snapshot();
        store.put("bob", emb(&[0.0, 1.0])).unwrap();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_concurrent_writers_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        let store = Arc::new(GalleryStore::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.put(&format!("staff-{i}"), emb(&[i as f32, 1.0])).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 8);
        assert_eq!(GalleryStore::load(&path).unwrap().len(), 8);
    }
}
