//! catchup-core: synchronization engine
//!
//! Compares a local working tree with a remote version-controlled tree
//! against a persisted baseline, classifies every path, filters the result
//! for display and resolves subtrees in bulk.

pub mod base;
pub mod classify;
pub mod config;
pub mod error;
pub mod filter;
pub mod hash;
pub mod merge;
pub mod monitor;
pub mod resource;
pub mod scan;
pub mod session;
pub mod snapshot;
pub mod transport;
pub mod tree;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use base::{BaseEntry, BaseState};
pub use classify::{Change, Classifier, CompareConfig, ContentPolicy, Direction, Granularity, SyncKind};
pub use config::CatchupConfig;
pub use error::{Error, Result, TransportError, TransportErrorKind};
pub use filter::{FilterMask, FilterToggles, SyncMode, VisibilityCache, is_visible};
pub use hash::ContentHash;
pub use merge::{MergeDirection, MergeReport};
pub use monitor::{CancelFlag, Monitor, NullMonitor};
pub use resource::{RemoteFile, RemoteFolder, RemoteResource, Tag, VersionedResourceId};
pub use scan::{FileEntry, Scanner};
pub use session::{Session, SessionOptions};
pub use snapshot::Snapshot;
pub use transport::{Command, CommandKind, CommandOption, LogEntry, RepositoryLocation, Transport};
pub use tree::{DiffNode, DiffTree, NodeId};
pub use workspace::Workspace;
