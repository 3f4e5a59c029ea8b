//! Immutable remote snapshots and their fetch-once content cache
//!
//! A [`RemoteFile`] is pinned to exactly one revision, so once its bytes have
//! been retrieved they never change. The cache is a write-once cell: the
//! first successful fetch fills it, failures leave it empty so the next call
//! starts over, and concurrent callers on the same object wait for a single
//! in-flight request instead of issuing their own.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::monitor::{Monitor, NullMonitor};
use crate::transport::{
    Command, CommandKind, CommandOption, ContentReceiver, GlobalOption, ListingCollector,
    ListingKind, LogCollector, LogEntry, Outcome, RepositoryLocation, SERVER_SEPARATOR, Transport,
};

/// Symbolic selector a snapshot was retrieved under
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tag {
    /// The default line of development
    #[default]
    Head,
    Branch(String),
    Version(String),
    Date(String),
}

impl Tag {
    #[must_use]
    pub fn is_head(&self) -> bool {
        matches!(self, Self::Head)
    }

    /// Command option selecting this tag; none for HEAD
    #[must_use]
    pub fn selector(&self) -> Option<CommandOption> {
        match self {
            Self::Head => None,
            Self::Branch(name) | Self::Version(name) => Some(CommandOption::Tag(name.clone())),
            Self::Date(date) => Some(CommandOption::Date(date.clone())),
        }
    }
}

impl FromStr for Tag {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(if s.is_empty() || s == "HEAD" {
            Self::Head
        } else if let Some(name) = s.strip_prefix("branch:") {
            Self::Branch(name.to_string())
        } else if let Some(name) = s.strip_prefix("version:") {
            Self::Version(name.to_string())
        } else if let Some(date) = s.strip_prefix("date:") {
            Self::Date(date.to_string())
        } else {
            Self::Version(s.to_string())
        })
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Head => write!(f, "HEAD"),
            Self::Branch(name) => write!(f, "branch:{name}"),
            Self::Version(name) => write!(f, "{name}"),
            Self::Date(date) => write!(f, "date:{date}"),
        }
    }
}

/// Identifies one snapshot of a remote file or folder.
///
/// Identity is `(path, name, revision)`; the tag only affects how the
/// snapshot is retrieved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedResourceId {
    /// Parent folder segments from the repository root
    pub path: Vec<String>,
    pub name: String,
    pub revision: String,
    pub tag: Tag,
}

impl VersionedResourceId {
    /// Path of the resource itself, `/`-separated
    #[must_use]
    pub fn relative_path(&self) -> String {
        let mut out = String::new();
        for segment in self.path.iter().chain(std::iter::once(&self.name)) {
            if segment.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(SERVER_SEPARATOR);
            }
            out.push_str(segment);
        }
        out
    }

    /// Segments of the resource itself (parent path plus name)
    #[must_use]
    pub fn segments(&self) -> Vec<String> {
        let mut segments = self.path.clone();
        if !self.name.is_empty() {
            segments.push(self.name.clone());
        }
        segments
    }
}

impl PartialEq for VersionedResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.name == other.name && self.revision == other.revision
    }
}

impl Eq for VersionedResourceId {}

impl Hash for VersionedResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.name.hash(state);
        self.revision.hash(state);
    }
}

/// A remote file pinned to one revision
#[derive(Debug)]
pub struct RemoteFile {
    id: VersionedResourceId,
    repository: RepositoryLocation,
    binary: bool,
    contents: OnceCell<Bytes>,
}

impl RemoteFile {
    #[must_use]
    pub fn new(
        repository: RepositoryLocation,
        path: Vec<String>,
        name: impl Into<String>,
        revision: impl Into<String>,
        tag: Tag,
    ) -> Self {
        Self {
            id: VersionedResourceId {
                path,
                name: name.into(),
                revision: revision.into(),
                tag,
            },
            repository,
            binary: false,
            contents: OnceCell::new(),
        }
    }

    /// Mark the file as binary (no line-ending translation on retrieval)
    #[must_use]
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    #[must_use]
    pub fn id(&self) -> &VersionedResourceId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    #[must_use]
    pub fn revision(&self) -> &str {
        &self.id.revision
    }

    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.binary
    }

    #[must_use]
    pub fn repository(&self) -> &RepositoryLocation {
        &self.repository
    }

    /// True until content has been fetched successfully
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.contents.initialized()
    }

    /// Cached content, without fetching
    #[must_use]
    pub fn cached(&self) -> Option<&Bytes> {
        self.contents.get()
    }

    /// Local options for an `Update` of this snapshot
    fn update_options(&self, tag_override: Option<&Tag>) -> Vec<CommandOption> {
        let mut options = vec![
            CommandOption::Revision(self.id.revision.clone()),
            CommandOption::CleanCopy,
        ];
        options.extend(tag_override.unwrap_or(&self.id.tag).selector());
        options
    }

    /// Return the file's content, retrieving it on first use.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the retrieval fails; nothing is cached
    /// in that case.
    pub async fn fetch_content(
        &self,
        transport: &dyn Transport,
        tag_override: Option<&Tag>,
        monitor: &dyn Monitor,
    ) -> Result<Bytes> {
        if let Some(bytes) = self.contents.get() {
            trace!(path = %self.id.relative_path(), "content cache hit");
            return Ok(bytes.clone());
        }

        let bytes = self
            .contents
            .get_or_try_init(|| async {
                let command = Command::new(
                    CommandKind::Update,
                    self.repository.clone(),
                    self.id.path.clone(),
                )
                .global(GlobalOption::Quiet)
                .target(self.id.name.clone())
                .options(self.update_options(tag_override));

                debug!(
                    path = %self.id.relative_path(),
                    revision = %self.id.revision,
                    "fetching remote content"
                );

                let mut receiver = ContentReceiver::new();
                let outcome = transport.execute(&command, monitor, &mut receiver).await?;
                if let Outcome::Warnings(warnings) = outcome {
                    for warning in warnings {
                        warn!(path = %self.id.relative_path(), "{warning}");
                    }
                }

                receiver.into_contents().ok_or_else(|| {
                    Error::from(TransportError::protocol(format!(
                        "server sent no content for {}",
                        self.id.relative_path()
                    )))
                })
            })
            .await?;

        Ok(bytes.clone())
    }

    /// Retrieve this file's history in server order.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the history request fails.
    pub async fn fetch_log(
        &self,
        transport: &dyn Transport,
        monitor: &dyn Monitor,
    ) -> Result<Vec<LogEntry>> {
        let command = Command::new(CommandKind::Log, self.repository.clone(), self.id.path.clone())
            .target(self.id.name.clone());

        let mut collector = LogCollector::default();
        transport.execute(&command, monitor, &mut collector).await?;
        Ok(collector.entries)
    }

    /// A fresh snapshot of the same file at `revision` (tag reset to HEAD)
    #[must_use]
    pub fn with_revision(&self, revision: impl Into<String>) -> Self {
        Self::new(
            self.repository.clone(),
            self.id.path.clone(),
            self.id.name.clone(),
            revision,
            Tag::Head,
        )
        .binary(self.binary)
    }
}

/// A remote folder and the snapshots listed beneath it
#[derive(Debug)]
pub struct RemoteFolder {
    id: VersionedResourceId,
    children: Vec<RemoteResource>,
}

/// Either kind of remote snapshot
#[derive(Debug, Clone)]
pub enum RemoteResource {
    File(Arc<RemoteFile>),
    Folder(Arc<RemoteFolder>),
}

impl RemoteResource {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File(file) => file.name(),
            Self::Folder(folder) => folder.name(),
        }
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder(_))
    }

    #[must_use]
    pub fn as_file(&self) -> Option<&Arc<RemoteFile>> {
        match self {
            Self::File(file) => Some(file),
            Self::Folder(_) => None,
        }
    }

    #[must_use]
    pub fn as_folder(&self) -> Option<&Arc<RemoteFolder>> {
        match self {
            Self::Folder(folder) => Some(folder),
            Self::File(_) => None,
        }
    }
}

impl RemoteFolder {
    #[must_use]
    pub fn new(path: Vec<String>, name: impl Into<String>, tag: Tag) -> Self {
        Self {
            id: VersionedResourceId {
                path,
                name: name.into(),
                revision: String::new(),
                tag,
            },
            children: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_children(mut self, children: Vec<RemoteResource>) -> Self {
        self.children = children;
        self
    }

    #[must_use]
    pub fn id(&self) -> &VersionedResourceId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Children in listing order
    #[must_use]
    pub fn children(&self) -> &[RemoteResource] {
        &self.children
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Option<&RemoteResource> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Every file at any depth below this folder
    #[must_use]
    pub fn files(&self) -> Vec<Arc<RemoteFile>> {
        let mut files = Vec::new();
        let mut stack = vec![self];
        while let Some(folder) = stack.pop() {
            for child in &folder.children {
                match child {
                    RemoteResource::File(file) => files.push(Arc::clone(file)),
                    RemoteResource::Folder(sub) => stack.push(sub),
                }
            }
        }
        files
    }

    /// List the folder at `path` recursively and build its snapshot tree.
    ///
    /// # Errors
    /// Returns [`Error::Transport`] if the listing fails.
    pub async fn fetch(
        transport: &dyn Transport,
        repository: &RepositoryLocation,
        path: Vec<String>,
        tag: &Tag,
        monitor: &dyn Monitor,
    ) -> Result<Self> {
        let command = Command::new(CommandKind::List, repository.clone(), path.clone())
            .option(CommandOption::Recursive)
            .options(tag.selector());

        let mut collector = ListingCollector::default();
        transport.execute(&command, monitor, &mut collector).await?;
        debug!(entries = collector.entries.len(), "listed remote folder");

        let mut root = PendingFolder::default();
        for entry in collector.entries {
            root.insert(&entry.path, entry.kind);
        }

        let (parent, name) = match path.split_last() {
            Some((name, parent)) => (parent.to_vec(), name.clone()),
            None => (Vec::new(), String::new()),
        };
        Ok(root.finish(repository, parent, name, tag))
    }
}

/// Mutable folder used while assembling a listing into snapshots
#[derive(Default)]
struct PendingFolder {
    files: Vec<(String, String, bool)>,
    folders: Vec<(String, PendingFolder)>,
    /// Children in listing order
    order: Vec<Slot>,
}

enum Slot {
    File(usize),
    Folder(usize),
}

impl PendingFolder {
    fn insert(&mut self, path: &[String], kind: ListingKind) {
        let Some((first, rest)) = path.split_first() else {
            return;
        };

        if !rest.is_empty() {
            self.folder_mut(first).insert(rest, kind);
            return;
        }
        match kind {
            ListingKind::File { revision, binary } => {
                self.files.push((first.clone(), revision, binary));
                self.order.push(Slot::File(self.files.len() - 1));
            }
            ListingKind::Folder => {
                self.folder_mut(first);
            }
        }
    }

    /// Whether any file lives in this folder or below it
    fn has_files(&self) -> bool {
        !self.files.is_empty() || self.folders.iter().any(|(_, f)| f.has_files())
    }

    fn folder_mut(&mut self, name: &str) -> &mut Self {
        let index = match self.folders.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.folders.push((name.to_string(), Self::default()));
                self.order.push(Slot::Folder(self.folders.len() - 1));
                self.folders.len() - 1
            }
        };
        &mut self.folders[index].1
    }

    fn finish(
        self,
        repository: &RepositoryLocation,
        parent: Vec<String>,
        name: String,
        tag: &Tag,
    ) -> RemoteFolder {
        let mut own_path = parent.clone();
        if !name.is_empty() {
            own_path.push(name.clone());
        }

        let mut files: Vec<_> = self.files.into_iter().map(Some).collect();
        let mut folders: Vec<_> = self.folders.into_iter().map(Some).collect();
        let children = self
            .order
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::File(index) => files.get_mut(index).and_then(Option::take).map(
                    |(child_name, revision, binary)| {
                        RemoteResource::File(Arc::new(
                            RemoteFile::new(
                                repository.clone(),
                                own_path.clone(),
                                child_name,
                                revision,
                                tag.clone(),
                            )
                            .binary(binary),
                        ))
                    },
                ),
                // Folders without a file at any depth are left out
                Slot::Folder(index) => folders
                    .get_mut(index)
                    .and_then(Option::take)
                    .filter(|(_, folder)| folder.has_files())
                    .map(|(child_name, folder)| {
                        RemoteResource::Folder(Arc::new(folder.finish(
                            repository,
                            own_path.clone(),
                            child_name,
                            tag,
                        )))
                    }),
            })
            .collect();

        RemoteFolder::new(parent, name, tag.clone()).with_children(children)
    }
}

/// Fetch many independent files concurrently, at most `concurrency` at once.
///
/// Every task runs to completion; the first failure (if any) is returned
/// afterwards. Files whose content is already cached are skipped.
///
/// # Errors
/// Returns the first fetch failure encountered.
pub async fn prefetch(
    files: Vec<Arc<RemoteFile>>,
    transport: Arc<dyn Transport>,
    concurrency: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for file in files.into_iter().filter(|f| f.is_pending()) {
        let semaphore = Arc::clone(&semaphore);
        let transport = Arc::clone(&transport);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            file.fetch_content(transport.as_ref(), None, &NullMonitor)
                .await
                .map(|_| ())
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        if let Err(err) = result {
            warn!("prefetch failed: {err}");
            first_error.get_or_insert(err);
        }
    }

    first_error.map_or(Ok(()), Err)
}
