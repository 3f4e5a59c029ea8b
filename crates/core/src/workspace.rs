//! Access to the local working tree

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::scan::FileEntry;
use crate::snapshot::Snapshot;

/// Reads and writes files of the local working tree.
///
/// Paths are relative to the working-tree root.
#[async_trait]
pub trait Workspace: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Write `contents`, creating missing parent folders
    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;

    /// Delete a file; deleting a missing file succeeds
    async fn delete(&self, path: &Path) -> Result<()>;

    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Current metadata of a file, `None` if it does not exist
    async fn stat(&self, path: &Path) -> Result<Option<FileEntry>>;

    /// Snapshot of every tracked file in the tree
    async fn scan(&self) -> Result<Snapshot>;
}
