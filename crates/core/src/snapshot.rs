//! Local side of a comparison: the scanned working tree

use std::collections::BTreeMap;

use crate::base::path_key;
use crate::scan::FileEntry;

/// Scanned files keyed by the same `/`-separated path the baseline uses
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    #[must_use]
    pub fn from_entries(entries: Vec<FileEntry>) -> Self {
        let files = entries
            .into_iter()
            .map(|e| (path_key(&e.path), e))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Self { files }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FileEntry> {
        self.files.get(key)
    }

    /// Files in path order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &FileEntry)> {
        self.files.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Bytes on disk across all scanned files
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}
