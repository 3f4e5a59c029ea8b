//! Working tree on the local filesystem

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use catchup_core::error::{Error, Result};
use catchup_core::{FileEntry, Scanner, Snapshot, Workspace};

/// Workspace rooted at a local directory
pub struct LocalWorkspace {
    root: PathBuf,
    ignores: Vec<String>,
}

impl LocalWorkspace {
    /// Create a workspace for `root`, creating the directory if needed
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> color_eyre::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            ignores: Vec::new(),
        })
    }

    /// Also honour the ignore file at `path` when scanning
    #[must_use]
    pub fn with_ignore(mut self, path: impl Into<String>) -> Self {
        self.ignores.push(path.into());
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Workspace for LocalWorkspace {
    async fn read(&self, path: &Path) -> Result<Bytes> {
        let data = tokio::fs::read(self.full_path(path))
            .await
            .map_err(|e| Error::workspace(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::workspace(path, e))?;
        }

        tokio::fs::write(&full_path, contents)
            .await
            .map_err(|e| Error::workspace(path, e))
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::workspace(path, e)),
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| Error::workspace(path, e))
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileEntry>> {
        let full_path = self.full_path(path);
        if !full_path.is_file() {
            return Ok(None);
        }
        FileEntry::from_path(&full_path, path.to_path_buf())
            .map(Some)
            .map_err(|e| Error::workspace(path, e))
    }

    async fn scan(&self) -> Result<Snapshot> {
        let scanner = self
            .ignores
            .iter()
            .fold(Scanner::new(&self.root), |scanner, pattern| scanner.ignore(pattern));
        let entries = scanner.scan().map_err(|e| Error::workspace(&self.root, e))?;
        Ok(Snapshot::from_entries(entries))
    }
}
