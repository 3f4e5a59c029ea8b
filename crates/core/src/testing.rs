//! In-memory collaborators for unit tests

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Error, Result, TransportError, TransportErrorKind};
use crate::hash::ContentHash;
use crate::monitor::Monitor;
use crate::scan::FileEntry;
use crate::snapshot::Snapshot;
use crate::transport::{
    Command, CommandKind, ListingEntry, ListingKind, LogEntry, Outcome, ResponseHandler, Transport,
};
use crate::workspace::Workspace;

pub fn file_entry(path: &str, content: &[u8], mtime_secs: u64) -> FileEntry {
    FileEntry {
        path: PathBuf::from(path),
        size: content.len() as u64,
        modified: UNIX_EPOCH + Duration::from_secs(mtime_secs),
        hash: ContentHash::from_bytes(content),
    }
}

struct FakeRevision {
    path: String,
    revision: String,
    contents: Vec<u8>,
}

/// Transport serving revisions from memory and counting requests
#[derive(Default)]
pub struct FakeTransport {
    revisions: Mutex<Vec<FakeRevision>>,
    /// Folders listed even when they hold no file
    folders: Mutex<Vec<String>>,
    commands: Mutex<Vec<Command>>,
    updates: AtomicUsize,
    failing_updates: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, revision: &str, contents: &[u8]) -> Self {
        self.add_revision(path, revision, contents);
        self
    }

    pub fn with_folder(self, path: &str) -> Self {
        self.folders.lock().unwrap().push(path.to_string());
        self
    }

    /// Check in another revision; the last one added is the head
    pub fn add_revision(&self, path: &str, revision: &str, contents: &[u8]) {
        self.revisions.lock().unwrap().push(FakeRevision {
            path: path.to_string(),
            revision: revision.to_string(),
            contents: contents.to_vec(),
        });
    }

    /// Forget every revision of `path`
    pub fn remove_file(&self, path: &str) {
        self.revisions.lock().unwrap().retain(|r| r.path != path);
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn last_command(&self) -> Option<Command> {
        self.commands.lock().unwrap().last().cloned()
    }

    fn target_path(command: &Command) -> String {
        command
            .context
            .iter()
            .chain(command.targets.first())
            .filter(|s| !s.is_empty())
            .cloned()
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(
        &self,
        command: &Command,
        _monitor: &dyn Monitor,
        handler: &mut dyn ResponseHandler,
    ) -> std::result::Result<Outcome, TransportError> {
        self.commands.lock().unwrap().push(command.clone());
        let revisions = self.revisions.lock().unwrap();

        match command.kind {
            CommandKind::Update => {
                self.updates.fetch_add(1, Ordering::SeqCst);
                let failing = self.failing_updates.load(Ordering::SeqCst);
                if failing > 0 {
                    self.failing_updates.store(failing - 1, Ordering::SeqCst);
                    return Err(TransportError::new(
                        TransportErrorKind::Network,
                        "connection reset",
                    ));
                }

                let path = Self::target_path(command);
                let found = revisions
                    .iter()
                    .find(|r| r.path == path && Some(r.revision.as_str()) == command.revision())
                    .ok_or_else(|| TransportError::not_found(path.clone()))?;
                handler.receive_content(
                    &path,
                    &mut found.contents.as_slice(),
                    found.contents.len() as u64,
                    true,
                )?;
            }
            CommandKind::Log => {
                let path = Self::target_path(command);
                for r in revisions.iter().filter(|r| r.path == path) {
                    handler.log_entry(LogEntry {
                        revision: r.revision.clone(),
                        author: "tester".to_string(),
                        date_secs: 0,
                        comment: String::new(),
                        tags: Vec::new(),
                    });
                }
            }
            CommandKind::List => {
                let prefix = command.context.join("/");
                let relative_to = |path: &str| -> Option<Vec<String>> {
                    let relative = if prefix.is_empty() {
                        Some(path)
                    } else {
                        path.strip_prefix(&prefix).and_then(|p| p.strip_prefix('/'))
                    };
                    relative.map(|r| r.split('/').map(str::to_string).collect())
                };
                for folder in self.folders.lock().unwrap().iter() {
                    if let Some(path) = relative_to(folder) {
                        handler.listing_entry(ListingEntry {
                            path,
                            kind: ListingKind::Folder,
                        });
                    }
                }
                let mut heads: Vec<(String, String)> = Vec::new();
                for r in revisions.iter() {
                    match heads.iter_mut().find(|(p, _)| *p == r.path) {
                        Some(head) => head.1.clone_from(&r.revision),
                        None => heads.push((r.path.clone(), r.revision.clone())),
                    }
                }
                for (path, revision) in heads {
                    if let Some(path) = relative_to(&path) {
                        handler.listing_entry(ListingEntry {
                            path,
                            kind: ListingKind::File {
                                revision,
                                binary: false,
                            },
                        });
                    }
                }
            }
        }
        Ok(Outcome::Ok)
    }
}

/// Working tree held in memory with a ticking clock for mtimes
pub struct MemoryWorkspace {
    files: Mutex<BTreeMap<PathBuf, (Vec<u8>, u64)>>,
    failing_writes: Mutex<HashSet<PathBuf>>,
    clock: AtomicI64,
    writes: AtomicUsize,
}

impl Default for MemoryWorkspace {
    fn default() -> Self {
        Self {
            files: Mutex::default(),
            failing_writes: Mutex::default(),
            clock: AtomicI64::new(10_000),
            writes: AtomicUsize::new(0),
        }
    }
}

impl MemoryWorkspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, contents: &[u8], mtime_secs: u64) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(PathBuf::from(path), (contents.to_vec(), mtime_secs));
        self
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(Path::new(path))
            .map(|(c, _)| c.clone())
    }

    /// Writes and deletes seen so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes_to(&self, path: &str) {
        self.failing_writes
            .lock()
            .unwrap()
            .insert(PathBuf::from(path));
    }

    fn entry(path: &Path, contents: &[u8], mtime_secs: u64) -> FileEntry {
        FileEntry {
            path: path.to_path_buf(),
            size: contents.len() as u64,
            modified: UNIX_EPOCH + Duration::from_secs(mtime_secs),
            hash: ContentHash::from_bytes(contents),
        }
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    async fn read(&self, path: &Path) -> Result<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(c, _)| Bytes::from(c.clone()))
            .ok_or_else(|| Error::workspace(path, "no such file"))
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        if self.failing_writes.lock().unwrap().contains(path) {
            return Err(Error::workspace(path, "disk full"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mtime = self.clock.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(
            path.to_path_buf(),
            (contents.to_vec(), u64::try_from(mtime).unwrap()),
        );
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn create_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileEntry>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(path)
            .map(|(c, m)| Self::entry(path, c, *m)))
    }

    async fn scan(&self) -> Result<Snapshot> {
        let entries = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(p, (c, m))| Self::entry(p, c, *m))
            .collect();
        Ok(Snapshot::from_entries(entries))
    }
}

/// Monitor that requests cancellation once `limit` units were reported
pub struct CancelAfter {
    limit: u64,
    worked: AtomicU64,
}

impl CancelAfter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            worked: AtomicU64::new(0),
        }
    }
}

impl Monitor for CancelAfter {
    fn is_cancelled(&self) -> bool {
        self.worked.load(Ordering::SeqCst) >= self.limit
    }

    fn worked(&self, units: u64) {
        self.worked.fetch_add(units, Ordering::SeqCst);
    }

    fn sub_task(&self, _label: &str) {}
}
