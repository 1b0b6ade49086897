//! Enrolled signatures, loaded from a JSON file at startup.

use rollcall_core::GalleryEntry;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("failed to read gallery {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid gallery {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("gallery entry {identity_id} has {actual} dimensions, expected {expected}")]
    Dimension {
        identity_id: String,
        expected: usize,
        actual: usize,
    },
}

/// All enrolled signatures. Sessions receive a subset via [`select`](Self::select).
#[derive(Debug, Clone, Default)]
pub struct GalleryStore {
    entries: Vec<GalleryEntry>,
}

impl GalleryStore {
    /// Build a store, rejecting entries whose dimensionality disagrees with
    /// `expected_dim` (or, if `None`, with the first entry).
    pub fn new(entries: Vec<GalleryEntry>, expected_dim: Option<usize>) -> Result<Self, GalleryError> {
        let expected = expected_dim.or_else(|| entries.first().map(|e| e.signature.len()));
        if let Some(expected) = expected {
            if let Some(bad) = entries.iter().find(|e| e.signature.len() != expected) {
                return Err(GalleryError::Dimension {
                    identity_id: bad.identity_id.clone(),
                    expected,
                    actual: bad.signature.len(),
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path, expected_dim: Option<usize>) -> Result<Self, GalleryError> {
        let text = std::fs::read_to_string(path).map_err(|source| GalleryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: Vec<GalleryEntry> =
            serde_json::from_str(&text).map_err(|source| GalleryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let store = Self::new(entries, expected_dim)?;
        tracing::info!(
            path = %path.display(),
            entries = store.len(),
            identities = store.identity_count(),
            "gallery loaded"
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.identity_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Every stored signature for the given identities, in store order.
    /// An empty id list selects the whole gallery.
    pub fn select(&self, identity_ids: &[String]) -> Vec<GalleryEntry> {
        if identity_ids.is_empty() {
            return self.entries.clone();
        }
        let wanted: HashSet<&str> = identity_ids.iter().map(String::as_str).collect();
        self.entries
            .iter()
            .filter(|e| wanted.contains(e.identity_id.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<GalleryEntry> {
        vec![
            GalleryEntry::new("s-1", "Ada", vec![0.0, 0.1]),
            GalleryEntry::new("s-2", "Grace", vec![0.5, 0.5]),
            GalleryEntry::new("s-1", "Ada", vec![0.05, 0.1]),
        ]
    }

    #[test]
    fn test_select_subset_keeps_duplicates() {
        let store = GalleryStore::new(entries(), Some(2)).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.identity_count(), 2);

        let subset = store.select(&["s-1".to_string()]);
        assert_eq!(subset.len(), 2);
        assert!(subset.iter().all(|e| e.identity_id == "s-1"));

        assert_eq!(store.select(&[]).len(), 3);
        assert!(store.select(&["nobody".to_string()]).is_empty());
    }

    #[test]
    fn test_rejects_mixed_dimensions() {
        let mut mixed = entries();
        mixed.push(GalleryEntry::new("s-3", "Linus", vec![0.0, 0.0, 0.0]));
        match GalleryStore::new(mixed, None) {
            Err(GalleryError::Dimension { identity_id, expected, actual }) => {
                assert_eq!(identity_id, "s-3");
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(matches!(
            GalleryStore::new(entries(), Some(128)),
            Err(GalleryError::Dimension { expected: 128, .. })
        ));
    }

    #[test]
    fn test_load_from_json_file() {
        let path = std::env::temp_dir().join(format!("rollcall-gallery-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"[{"identity_id":"s-9","display_name":"Edsger","signature":[0.25,0.75]}]"#,
        )
        .unwrap();

        let store = GalleryStore::load(&path, None).unwrap();
        std::fs::remove_file(&path).unwrap();
        let all = store.select(&[]);
        assert_eq!(all[0].display_name, "Edsger");
        assert_eq!(all[0].signature.values(), &[0.25f32, 0.75]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = GalleryStore::load(Path::new("/nonexistent/rollcall/gallery.json"), None).unwrap_err();
        assert!(matches!(err, GalleryError::Read { .. }));
    }
}
