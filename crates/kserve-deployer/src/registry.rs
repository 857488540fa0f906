//! Session-wide set of discovered checkpoints.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::resolver::RewriteTable;

/// A checkpoint directory seen in training output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Absolute path on the training filesystem
    pub original_path: String,
    pub first_seen: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Deployment-visible path under `rewrites`.
    pub fn mapped_path(&self, rewrites: &RewriteTable) -> String {
        rewrites.map(&self.original_path)
    }
}

/// Append-only registry keyed by original path.
///
/// Shared between the foreground and the log monitor; every access takes the
/// lock, so readers never see a partially inserted record.
#[derive(Debug, Default)]
pub struct CheckpointRegistry {
    records: RwLock<BTreeMap<String, CheckpointRecord>>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `path` if unseen. Returns `true` when the path is new.
    pub fn record(&self, path: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        if records.contains_key(path) {
            return false;
        }
        records.insert(
            path.to_string(),
            CheckpointRecord {
                original_path: path.to_string(),
                first_seen: now,
            },
        );
        true
    }

    /// Sorted, de-duplicated deployment paths of every record.
    pub fn mapped_paths(&self, rewrites: &RewriteTable) -> Vec<String> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut paths: Vec<String> = records.values().map(|r| r.mapped_path(rewrites)).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Snapshot of all records ordered by original path.
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record. Only used on session reset.
    pub fn clear(&self) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_reports_novelty_and_keeps_first_seen() {
        let registry = CheckpointRegistry::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(30);

        assert!(registry.record("/opt/data/ckpt-1", t0));
        assert!(!registry.record("/opt/data/ckpt-1", t1));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.records()[0].first_seen, t0);
    }

    #[test]
    fn mapped_paths_are_sorted_and_deduplicated() {
        let registry = CheckpointRegistry::new();
        let now = Utc::now();
        for path in ["/train/b", "/scratch/b", "/train/a", "/other/c"] {
            registry.record(path, now);
        }
        let rewrites = RewriteTable::new([
            ("/train".to_string(), "/serve".to_string()),
            ("/scratch".to_string(), "/serve".to_string()),
        ]);
        assert_eq!(
            registry.mapped_paths(&rewrites),
            vec!["/other/c", "/serve/a", "/serve/b"]
        );
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn clear_resets_registry() {
        let registry = CheckpointRegistry::new();
        registry.record("/a", Utc::now());
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.record("/a", Utc::now()));
    }

    #[test]
    fn concurrent_writers_insert_each_path_once() {
        let registry = Arc::new(CheckpointRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|i| registry.record(&format!("/ckpt/{i}"), Utc::now()))
                        .count()
                })
            })
            .collect();
        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 50);
        assert_eq!(registry.len(), 50);
    }
}
