//! A synchronization session over one working tree
//!
//! The session owns the collaborators, the baseline and the current diff
//! tree, and answers the queries a view needs: children, classification and
//! visibility. Resolution runs through it so the baseline stays in step with
//! the tree.

use std::sync::Arc;

use tracing::{debug, info};

use crate::base::BaseState;
use crate::classify::{Classifier, CompareConfig, SyncKind};
use crate::error::{Error, Result, TransportError};
use crate::filter::{FilterMask, VisibilityCache};
use crate::merge::{self, MergeDirection, MergeReport};
use crate::monitor::Monitor;
use crate::resource::{RemoteFolder, Tag, prefetch};
use crate::snapshot::Snapshot;
use crate::transport::{LogEntry, RepositoryLocation, Transport};
use crate::tree::{DiffNode, DiffTree, NodeId};
use crate::workspace::Workspace;

/// Default number of concurrent content fetches during refresh
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// What a session compares against
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub repository: RepositoryLocation,
    pub tag: Tag,
    /// Remote folder mapped to the working-tree root
    pub remote_path: Vec<String>,
    pub compare: CompareConfig,
    pub fetch_concurrency: usize,
}

impl SessionOptions {
    #[must_use]
    pub fn new(repository: RepositoryLocation) -> Self {
        Self {
            repository,
            tag: Tag::Head,
            remote_path: Vec::new(),
            compare: CompareConfig::default(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }
}

pub struct Session {
    transport: Arc<dyn Transport>,
    workspace: Arc<dyn Workspace>,
    options: SessionOptions,
    base: BaseState,
    tree: DiffTree,
    visibility: VisibilityCache,
}

impl Session {
    /// Open a session and run the first refresh.
    ///
    /// # Errors
    /// Fails if the local scan, the remote listing or a content fetch fails,
    /// or if the monitor cancels.
    pub async fn open(
        transport: Arc<dyn Transport>,
        workspace: Arc<dyn Workspace>,
        mut base: BaseState,
        options: SessionOptions,
        monitor: &dyn Monitor,
    ) -> Result<Self> {
        if base.repository.is_empty() {
            base.repository = options.repository.to_string();
        }
        if base.tag.is_empty() {
            base.tag = options.tag.to_string();
        }

        let mut session = Self {
            transport,
            workspace,
            options,
            base,
            tree: DiffTree::assemble(&Snapshot::empty(), &BaseState::default(), None),
            visibility: VisibilityCache::new(),
        };
        session.refresh(monitor).await?;
        Ok(session)
    }

    fn classifier(&self) -> Classifier<'_> {
        Classifier::new(
            self.transport.as_ref(),
            self.workspace.as_ref(),
            self.options.compare,
        )
    }

    /// Rebuild the tree from a fresh scan and listing.
    ///
    /// Remote content needed for classification is fetched concurrently
    /// first; the previous tree is kept if anything fails.
    ///
    /// # Errors
    /// See [`Session::open`].
    pub async fn refresh(&mut self, monitor: &dyn Monitor) -> Result<()> {
        monitor.sub_task("scanning working tree");
        let local = self.workspace.scan().await?;

        monitor.sub_task("listing remote");
        let remote = RemoteFolder::fetch(
            self.transport.as_ref(),
            &self.options.repository,
            self.options.remote_path.clone(),
            &self.options.tag,
            monitor,
        )
        .await?;
        let remote = Arc::new(remote);

        let classifier = self.classifier();
        let mut tree = DiffTree::assemble(&local, &self.base, Some(&remote));

        let candidates = tree.content_candidates(&classifier);
        if !candidates.is_empty() {
            monitor.sub_task("fetching remote content");
            debug!(files = candidates.len(), "prefetching");
            prefetch(
                candidates,
                Arc::clone(&self.transport),
                self.options.fetch_concurrency,
            )
            .await?;
        }
        if monitor.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tree.classify_files(&classifier, monitor).await?;

        info!(
            nodes = tree.len(),
            local = local.len(),
            local_bytes = local.total_size(),
            remote = remote.files().len(),
            "session refreshed"
        );
        self.tree = tree;
        self.visibility.invalidate();
        Ok(())
    }

    #[must_use]
    pub fn tree(&self) -> &DiffTree {
        &self.tree
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn node(&self, id: NodeId) -> Result<&DiffNode> {
        self.tree.node(id)
    }

    #[must_use]
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.tree.find(path)
    }

    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        self.tree.children(id)
    }

    /// Classification including descendants
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn classification(&self, id: NodeId) -> Result<SyncKind> {
        self.tree.node(id)?;
        Ok(self.tree.aggregate(id))
    }

    pub fn is_visible(&mut self, id: NodeId, mask: FilterMask) -> bool {
        self.visibility.get(&self.tree, id, mask)
    }

    /// Children of `id` shown under `mask`, in display order
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn visible_children(&mut self, id: NodeId, mask: FilterMask) -> Result<Vec<NodeId>> {
        let children = self.tree.children(id)?.to_vec();
        Ok(children
            .into_iter()
            .filter(|c| self.visibility.get(&self.tree, *c, mask))
            .collect())
    }

    /// Resolve the subtree at `id`, updating the baseline as files settle.
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree; per-file
    /// failures are reported in the [`MergeReport`].
    pub async fn resolve(
        &mut self,
        id: NodeId,
        direction: MergeDirection,
        monitor: &dyn Monitor,
    ) -> Result<MergeReport> {
        let classifier = Classifier::new(
            self.transport.as_ref(),
            self.workspace.as_ref(),
            self.options.compare,
        );
        merge::resolve(
            &mut self.tree,
            id,
            direction,
            &classifier,
            &mut self.base,
            monitor,
        )
        .await
    }

    /// Force the subtree at `id` to in-sync without touching any file
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn mark_resolved(&mut self, id: NodeId) -> Result<()> {
        merge::mark_resolved(&mut self.tree, id)
    }

    #[must_use]
    pub fn compare_config(&self) -> CompareConfig {
        self.options.compare
    }

    /// Change how files are compared and reclassify everything
    ///
    /// # Errors
    /// See [`Session::refresh`].
    pub async fn set_compare_config(
        &mut self,
        config: CompareConfig,
        monitor: &dyn Monitor,
    ) -> Result<()> {
        self.options.compare = config;
        self.refresh(monitor).await
    }

    #[must_use]
    pub fn base_state(&self) -> &BaseState {
        &self.base
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// History of the remote file at `id`
    ///
    /// # Errors
    /// Fails if the node has no remote file or the request fails.
    pub async fn history(&self, id: NodeId, monitor: &dyn Monitor) -> Result<Vec<LogEntry>> {
        let node = self.tree.node(id)?;
        let remote = node.remote_file().ok_or_else(|| {
            Error::from(TransportError::not_found(format!(
                "{} has no remote file",
                node.path()
            )))
        })?;
        remote.fetch_log(self.transport.as_ref(), monitor).await
    }
}
