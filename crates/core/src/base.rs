//! Base state: the last-synchronized baseline of every file
//!
//! For each path it remembers the remote revision the local copy was last
//! brought in line with, and the local content hash and mtime at that point.
//! The classifier compares both sides against it to tell incoming changes
//! from outgoing ones.

use std::collections::HashMap;
use std::path::{Component, Path};

use rkyv::rancor::Error as RkyvError;
use rkyv::{Archive, Deserialize, Serialize};

use crate::hash::ContentHash;
use crate::scan::{ADMIN_DIR, FileEntry};

/// File name of the persisted base state inside [`ADMIN_DIR`]
pub const BASE_FILE: &str = "base.rkyv";

/// Baseline of one file
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct BaseEntry {
    /// Remote revision at last synchronization; empty if the record is damaged
    pub revision: String,
    /// Local content hash at last synchronization
    pub hash: [u8; 32],
    /// Local modification time at last synchronization (seconds since UNIX epoch)
    pub mtime_secs: i64,
    pub size: u64,
}

impl BaseEntry {
    /// Baseline adopting a scanned local file at `revision`
    #[must_use]
    pub fn from_entry(entry: &FileEntry, revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            hash: *entry.hash.as_bytes(),
            mtime_secs: entry.modified_secs(),
            size: entry.size,
        }
    }

    #[must_use]
    pub fn content_hash(&self) -> ContentHash {
        ContentHash::from_raw(self.hash)
    }

    /// Whether the record can be used for classification
    #[must_use]
    pub fn is_readable(&self) -> bool {
        !self.revision.is_empty()
    }
}

/// Result of looking a path up in the base state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseLookup<'a> {
    Absent,
    /// A record exists but cannot be trusted
    Unreadable,
    Present(&'a BaseEntry),
}

/// Baseline for a whole working tree
#[derive(Archive, Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct BaseState {
    /// Relative path (`/`-separated) -> baseline
    pub files: HashMap<String, BaseEntry>,
    /// Bumped on every recorded change
    pub version: u64,
    /// Repository the baseline refers to
    pub repository: String,
    /// Tag the baseline was taken from
    pub tag: String,
}

/// Normalize a relative path to the `/`-separated key used by [`BaseState`]
#[must_use]
pub fn path_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

impl BaseState {
    #[must_use]
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Load the base state of `root`, or an empty one if none was saved
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or decoded.
    pub fn load(root: &Path) -> color_eyre::Result<Self> {
        let state_path = root.join(ADMIN_DIR).join(BASE_FILE);

        if !state_path.exists() {
            return Ok(Self::default());
        }

        let bytes = std::fs::read(&state_path)?;
        let archived = rkyv::access::<ArchivedBaseState, RkyvError>(&bytes)
            .map_err(|e| color_eyre::eyre::eyre!("failed to access archived base state: {e}"))?;

        let state: Self = rkyv::deserialize::<Self, RkyvError>(archived)
            .map_err(|e| color_eyre::eyre::eyre!("failed to deserialize base state: {e}"))?;

        Ok(state)
    }

    /// Save the base state under `root`
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save(&self, root: &Path) -> color_eyre::Result<()> {
        let admin_dir = root.join(ADMIN_DIR);
        std::fs::create_dir_all(&admin_dir)?;

        let bytes = rkyv::to_bytes::<RkyvError>(self)
            .map_err(|e| color_eyre::eyre::eyre!("failed to serialize base state: {e}"))?;

        std::fs::write(admin_dir.join(BASE_FILE), &bytes)?;
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, path: &str) -> BaseLookup<'_> {
        match self.files.get(path) {
            None => BaseLookup::Absent,
            Some(entry) if !entry.is_readable() => BaseLookup::Unreadable,
            Some(entry) => BaseLookup::Present(entry),
        }
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&BaseEntry> {
        self.files.get(path)
    }

    /// Record a new baseline for `path`
    pub fn record(&mut self, path: impl Into<String>, entry: BaseEntry) {
        self.version += 1;
        self.files.insert(path.into(), entry);
    }

    /// Forget the baseline of `path`
    pub fn remove(&mut self, path: &str) -> Option<BaseEntry> {
        let removed = self.files.remove(path);
        if removed.is_some() {
            self.version += 1;
        }
        removed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
