//! Three-way synchronization classification
//!
//! Every path is judged from three observations: the local file, its
//! baseline in the [`BaseState`](crate::base::BaseState), and the remote
//! snapshot. [`decide`] is the pure decision table; [`Classifier`] gathers
//! the observations and only fetches remote content when the table needs to
//! know whether both sides ended up with the same bytes.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::base::{BaseEntry, BaseLookup};
use crate::error::Result;
use crate::hash::ContentHash;
use crate::monitor::Monitor;
use crate::resource::RemoteFile;
use crate::scan::FileEntry;
use crate::transport::Transport;
use crate::workspace::Workspace;

/// What kind of change separates the two sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    None,
    Added,
    Removed,
    Changed,
}

/// Which side the change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Incoming,
    Outgoing,
    Conflicting,
}

/// Synchronization classification of one node.
///
/// Only consistent values can be built: no direction without a change, and
/// the pseudo flag only on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncKind {
    change: Change,
    direction: Option<Direction>,
    pseudo_conflict: bool,
}

impl Default for SyncKind {
    fn default() -> Self {
        Self::IN_SYNC
    }
}

impl SyncKind {
    pub const IN_SYNC: Self = Self {
        change: Change::None,
        direction: None,
        pseudo_conflict: false,
    };

    #[must_use]
    pub const fn new(change: Change, direction: Direction) -> Self {
        if matches!(change, Change::None) {
            return Self::IN_SYNC;
        }
        Self {
            change,
            direction: Some(direction),
            pseudo_conflict: false,
        }
    }

    #[must_use]
    pub const fn incoming(change: Change) -> Self {
        Self::new(change, Direction::Incoming)
    }

    #[must_use]
    pub const fn outgoing(change: Change) -> Self {
        Self::new(change, Direction::Outgoing)
    }

    #[must_use]
    pub const fn conflicting(change: Change) -> Self {
        Self::new(change, Direction::Conflicting)
    }

    /// A conflict whose two sides turned out identical
    #[must_use]
    pub const fn pseudo_conflict(change: Change) -> Self {
        let mut kind = Self::conflicting(change);
        kind.pseudo_conflict = kind.direction.is_some();
        kind
    }

    #[must_use]
    pub const fn change(self) -> Change {
        self.change
    }

    #[must_use]
    pub const fn direction(self) -> Option<Direction> {
        self.direction
    }

    #[must_use]
    pub const fn is_pseudo_conflict(self) -> bool {
        self.pseudo_conflict
    }

    #[must_use]
    pub const fn is_in_sync(self) -> bool {
        matches!(self.change, Change::None)
    }

    #[must_use]
    pub const fn is_conflict(self) -> bool {
        matches!(self.direction, Some(Direction::Conflicting))
    }

    /// Combine several classifications into the one a container displays.
    ///
    /// In-sync inputs are ignored. Differing change kinds combine to
    /// [`Change::Changed`], differing directions to
    /// [`Direction::Conflicting`], and the result is a pseudo conflict only
    /// if every out-of-sync input is one.
    #[must_use]
    pub fn aggregate(kinds: impl IntoIterator<Item = Self>) -> Self {
        let mut result: Option<Self> = None;
        for kind in kinds.into_iter().filter(|k| !k.is_in_sync()) {
            result = Some(match result {
                None => kind,
                Some(acc) => Self {
                    change: if acc.change == kind.change {
                        acc.change
                    } else {
                        Change::Changed
                    },
                    direction: if acc.direction == kind.direction {
                        acc.direction
                    } else {
                        Some(Direction::Conflicting)
                    },
                    pseudo_conflict: acc.pseudo_conflict && kind.pseudo_conflict,
                },
            });
        }
        result.unwrap_or(Self::IN_SYNC)
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let change = match self.change {
            Change::None => return write!(f, "in sync"),
            Change::Added => "added",
            Change::Removed => "removed",
            Change::Changed => "changed",
        };
        let direction = match self.direction {
            Some(Direction::Incoming) => "incoming",
            Some(Direction::Outgoing) => "outgoing",
            Some(Direction::Conflicting) if self.pseudo_conflict => "pseudo-conflict",
            Some(Direction::Conflicting) => "conflict",
            None => return write!(f, "{change}"),
        };
        write!(f, "{change} ({direction})")
    }
}

/// How a side relates to its baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideState {
    Absent,
    /// Present and unchanged since the baseline
    Unchanged,
    /// Present and changed since the baseline (or present with no baseline)
    Modified,
}

impl SideState {
    const fn is_present(self) -> bool {
        !matches!(self, Self::Absent)
    }
}

/// What the baseline says about a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseStatus {
    Absent,
    Unreadable,
    Present,
}

impl From<BaseLookup<'_>> for BaseStatus {
    fn from(lookup: BaseLookup<'_>) -> Self {
        match lookup {
            BaseLookup::Absent => Self::Absent,
            BaseLookup::Unreadable => Self::Unreadable,
            BaseLookup::Present(_) => Self::Present,
        }
    }
}

/// Whether [`decide`] needs to know if both sides hold identical content
#[must_use]
pub fn needs_content(local: SideState, base: BaseStatus, remote: SideState) -> bool {
    match base {
        BaseStatus::Unreadable => false,
        BaseStatus::Present => local == SideState::Modified && remote == SideState::Modified,
        BaseStatus::Absent => local.is_present() && remote.is_present(),
    }
}

/// The classification table.
///
/// `contents_equal` is only consulted where [`needs_content`] says so;
/// passing `None` there classifies as a plain conflict.
#[must_use]
pub fn decide(
    local: SideState,
    base: BaseStatus,
    remote: SideState,
    contents_equal: Option<bool>,
) -> SyncKind {
    use SideState::{Absent, Modified, Unchanged};

    let same = contents_equal == Some(true);
    match base {
        BaseStatus::Unreadable => SyncKind::conflicting(Change::Changed),
        BaseStatus::Present => match (local, remote) {
            (Unchanged, Unchanged) => SyncKind::IN_SYNC,
            (Modified, Unchanged) => SyncKind::outgoing(Change::Changed),
            (Unchanged, Modified) => SyncKind::incoming(Change::Changed),
            (Modified, Modified) if same => SyncKind::pseudo_conflict(Change::Changed),
            (Modified, Modified) | (Modified, Absent) => SyncKind::conflicting(Change::Changed),
            (Absent, Unchanged | Modified) => SyncKind::outgoing(Change::Removed),
            (Unchanged, Absent) => SyncKind::incoming(Change::Removed),
            (Absent, Absent) => SyncKind::pseudo_conflict(Change::Removed),
        },
        BaseStatus::Absent => match (local.is_present(), remote.is_present()) {
            (true, false) => SyncKind::outgoing(Change::Added),
            (false, true) => SyncKind::incoming(Change::Added),
            (true, true) if same => SyncKind::pseudo_conflict(Change::Added),
            (true, true) => SyncKind::conflicting(Change::Added),
            (false, false) => SyncKind::IN_SYNC,
        },
    }
}

/// Classification of a folder from existence alone.
///
/// `had_base` tells whether anything beneath the folder was ever
/// synchronized, which decides between an addition on one side and a
/// removal on the other.
#[must_use]
pub fn classify_folder(local: bool, had_base: bool, remote: bool) -> SyncKind {
    match (local, remote) {
        (true, true) | (false, false) => SyncKind::IN_SYNC,
        (true, false) if had_base => SyncKind::incoming(Change::Removed),
        (true, false) => SyncKind::outgoing(Change::Added),
        (false, true) if had_base => SyncKind::outgoing(Change::Removed),
        (false, true) => SyncKind::incoming(Change::Added),
    }
}

/// How local files are compared with their baseline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Compare content hashes
    #[default]
    Contents,
    /// Compare modification times (whole seconds)
    Timestamp,
}

/// How local and remote bytes are compared when both sides changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPolicy {
    /// Byte-for-byte equality
    #[default]
    Exact,
    /// Equality after dropping all ASCII whitespace
    IgnoreWhitespace,
}

impl ContentPolicy {
    /// Digest of `data` under this policy
    #[must_use]
    pub fn digest(self, data: &[u8]) -> ContentHash {
        match self {
            Self::Exact => ContentHash::from_bytes(data),
            Self::IgnoreWhitespace => ContentHash::ignoring_whitespace(data),
        }
    }

    #[must_use]
    pub fn equal(self, a: &[u8], b: &[u8]) -> bool {
        match self {
            Self::Exact => a == b,
            Self::IgnoreWhitespace => self.digest(a) == self.digest(b),
        }
    }
}

/// Comparison settings threaded through classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareConfig {
    pub granularity: Granularity,
    pub policy: ContentPolicy,
}

impl CompareConfig {
    /// Whether the local file still matches its baseline
    #[must_use]
    pub fn local_matches_base(&self, local: &FileEntry, base: &BaseEntry) -> bool {
        match self.granularity {
            Granularity::Contents => local.hash == base.content_hash(),
            Granularity::Timestamp => local.modified_secs() == base.mtime_secs,
        }
    }
}

/// Gathers observations for one path and applies [`decide`]
pub struct Classifier<'a> {
    transport: &'a dyn Transport,
    workspace: &'a dyn Workspace,
    config: CompareConfig,
}

impl<'a> Classifier<'a> {
    #[must_use]
    pub fn new(
        transport: &'a dyn Transport,
        workspace: &'a dyn Workspace,
        config: CompareConfig,
    ) -> Self {
        Self {
            transport,
            workspace,
            config,
        }
    }

    #[must_use]
    pub fn transport(&self) -> &'a dyn Transport {
        self.transport
    }

    #[must_use]
    pub fn workspace(&self) -> &'a dyn Workspace {
        self.workspace
    }

    #[must_use]
    pub fn config(&self) -> CompareConfig {
        self.config
    }

    /// Local and remote states relative to the baseline
    #[must_use]
    pub fn observe(
        &self,
        local: Option<&FileEntry>,
        base: BaseLookup<'_>,
        remote: Option<&RemoteFile>,
    ) -> (SideState, SideState) {
        let base_entry = match base {
            BaseLookup::Present(entry) => Some(entry),
            BaseLookup::Absent | BaseLookup::Unreadable => None,
        };

        let local_state = match (local, base_entry) {
            (None, _) => SideState::Absent,
            (Some(entry), Some(base)) if self.config.local_matches_base(entry, base) => {
                SideState::Unchanged
            }
            (Some(_), _) => SideState::Modified,
        };
        let remote_state = match (remote, base_entry) {
            (None, _) => SideState::Absent,
            (Some(file), Some(base)) if file.revision() == base.revision => SideState::Unchanged,
            (Some(_), _) => SideState::Modified,
        };
        (local_state, remote_state)
    }

    /// Classify one file.
    ///
    /// # Errors
    /// Returns an error if remote content is needed and cannot be fetched,
    /// or if the local file cannot be read for a whitespace-insensitive
    /// comparison.
    pub async fn classify(
        &self,
        local: Option<&FileEntry>,
        base: BaseLookup<'_>,
        remote: Option<&RemoteFile>,
        monitor: &dyn Monitor,
    ) -> Result<SyncKind> {
        let (local_state, remote_state) = self.observe(local, base, remote);
        let base_status = BaseStatus::from(base);

        let contents_equal = match (local, remote) {
            (Some(local), Some(remote))
                if needs_content(local_state, base_status, remote_state) =>
            {
                Some(self.contents_equal(local, remote, monitor).await?)
            }
            _ => None,
        };

        let kind = decide(local_state, base_status, remote_state, contents_equal);
        trace!(?local_state, ?base_status, ?remote_state, %kind, "classified");
        Ok(kind)
    }

    async fn contents_equal(
        &self,
        local: &FileEntry,
        remote: &RemoteFile,
        monitor: &dyn Monitor,
    ) -> Result<bool> {
        let remote_bytes = remote
            .fetch_content(self.transport, None, monitor)
            .await?;

        match self.config.policy {
            ContentPolicy::Exact => Ok(ContentHash::from_bytes(&remote_bytes) == local.hash),
            ContentPolicy::IgnoreWhitespace => {
                let local_bytes = self.workspace.read(&local.path).await?;
                Ok(self.config.policy.equal(&local_bytes, &remote_bytes))
            }
        }
    }
}
