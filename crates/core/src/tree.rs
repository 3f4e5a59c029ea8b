//! The diff tree: local, base and remote views merged by name
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Parents own
//! their children's ids; the parent link is a plain index. Children are
//! ordered folders first, then by name.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::base::{BaseEntry, BaseLookup, BaseState};
use crate::classify::{BaseStatus, Classifier, SyncKind, classify_folder, needs_content};
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::resource::{RemoteFile, RemoteFolder, RemoteResource};
use crate::scan::FileEntry;
use crate::snapshot::Snapshot;

/// Index of a node in its [`DiffTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// One file or folder of the merged view
#[derive(Debug, Clone)]
pub struct DiffNode {
    name: String,
    path: String,
    is_folder: bool,
    kind: SyncKind,
    /// Folder exists locally (files use `local`)
    local_folder: bool,
    /// Something beneath this folder has a baseline
    had_base: bool,
    local: Option<FileEntry>,
    base: Option<BaseEntry>,
    remote: Option<RemoteResource>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl DiffNode {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path relative to the tree root, `/`-separated
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn local_path(&self) -> PathBuf {
        PathBuf::from(&self.path)
    }

    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    /// The node's own classification, ignoring descendants
    #[must_use]
    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    #[must_use]
    pub fn local(&self) -> Option<&FileEntry> {
        self.local.as_ref()
    }

    #[must_use]
    pub fn base(&self) -> Option<&BaseEntry> {
        self.base.as_ref()
    }

    #[must_use]
    pub fn base_lookup(&self) -> BaseLookup<'_> {
        match &self.base {
            None => BaseLookup::Absent,
            Some(entry) if !entry.is_readable() => BaseLookup::Unreadable,
            Some(entry) => BaseLookup::Present(entry),
        }
    }

    #[must_use]
    pub fn remote(&self) -> Option<&RemoteResource> {
        self.remote.as_ref()
    }

    #[must_use]
    pub fn remote_file(&self) -> Option<&Arc<RemoteFile>> {
        self.remote.as_ref().and_then(RemoteResource::as_file)
    }

    /// Whether anything at or beneath this node has a baseline
    #[must_use]
    pub fn had_base(&self) -> bool {
        if self.is_folder {
            self.had_base
        } else {
            self.base.is_some()
        }
    }

    #[must_use]
    pub fn exists_locally(&self) -> bool {
        if self.is_folder {
            self.local_folder
        } else {
            self.local.is_some()
        }
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Local files grouped by folder
#[derive(Default)]
struct LocalDir<'a> {
    files: BTreeMap<String, &'a FileEntry>,
    dirs: BTreeMap<String, LocalDir<'a>>,
}

impl<'a> LocalDir<'a> {
    fn from_snapshot(snapshot: &'a Snapshot) -> Self {
        let mut root = Self::default();
        for (key, entry) in snapshot.entries() {
            let mut parts: Vec<&str> = key.split('/').collect();
            let Some(name) = parts.pop() else { continue };
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part.to_string()).or_default();
            }
            dir.files.insert(name.to_string(), entry);
        }
        root
    }
}

/// Baseline entries grouped by folder
#[derive(Default)]
struct BaseDir<'a> {
    files: BTreeMap<String, &'a BaseEntry>,
    dirs: BTreeMap<String, BaseDir<'a>>,
}

impl<'a> BaseDir<'a> {
    fn from_state(state: &'a BaseState) -> Self {
        let mut root = Self::default();
        for (key, entry) in &state.files {
            let mut parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
            let Some(name) = parts.pop() else { continue };
            let mut dir = &mut root;
            for part in parts {
                dir = dir.dirs.entry(part.to_string()).or_default();
            }
            dir.files.insert(name.to_string(), entry);
        }
        root
    }
}

/// The three views of one folder being merged
struct Level<'l, 'a> {
    local: Option<&'l LocalDir<'a>>,
    base: Option<&'l BaseDir<'a>>,
    remote: Option<&'l RemoteFolder>,
}

/// Arena of [`DiffNode`]s rooted at [`DiffTree::root`]
#[derive(Debug, Clone)]
pub struct DiffTree {
    nodes: Vec<DiffNode>,
    generation: u64,
}

impl DiffTree {
    /// Merge the three views by name without classifying files.
    ///
    /// Folder kinds are set from existence; file kinds start in sync.
    #[must_use]
    pub fn assemble(
        local: &Snapshot,
        base: &BaseState,
        remote: Option<&Arc<RemoteFolder>>,
    ) -> Self {
        let local_root = LocalDir::from_snapshot(local);
        let base_root = BaseDir::from_state(base);

        let mut tree = Self {
            nodes: vec![DiffNode {
                name: String::new(),
                path: String::new(),
                is_folder: true,
                kind: SyncKind::IN_SYNC,
                local_folder: true,
                had_base: !base.is_empty(),
                local: None,
                base: None,
                remote: remote.map(|f| RemoteResource::Folder(Arc::clone(f))),
                parent: None,
                children: Vec::new(),
            }],
            generation: 0,
        };

        tree.add_level(
            NodeId(0),
            &Level {
                local: Some(&local_root),
                base: Some(&base_root),
                remote: remote.map(|f| &**f),
            },
        );
        debug!(nodes = tree.nodes.len(), "assembled diff tree");
        tree
    }

    fn add_level(&mut self, parent: NodeId, level: &Level<'_, '_>) {
        let mut files: BTreeSet<&str> = BTreeSet::new();
        let mut dirs: BTreeSet<&str> = BTreeSet::new();

        if let Some(local) = level.local {
            files.extend(local.files.keys().map(String::as_str));
            dirs.extend(local.dirs.keys().map(String::as_str));
        }
        if let Some(base) = level.base {
            files.extend(base.files.keys().map(String::as_str));
            dirs.extend(base.dirs.keys().map(String::as_str));
        }
        if let Some(remote) = level.remote {
            for child in remote.children() {
                match child {
                    RemoteResource::File(f) => files.insert(f.name()),
                    RemoteResource::Folder(f) => dirs.insert(f.name()),
                };
            }
        }

        for name in &dirs {
            let local = level.local.and_then(|l| l.dirs.get(*name));
            let base = level.base.and_then(|b| b.dirs.get(*name));
            let remote = level
                .remote
                .and_then(|r| r.child(name))
                .and_then(RemoteResource::as_folder);

            let id = self.push(parent, name, true);
            let node = &mut self.nodes[id.0];
            node.local_folder = local.is_some();
            node.had_base = base.is_some();
            node.remote = remote.map(|f| RemoteResource::Folder(Arc::clone(f)));
            node.kind = classify_folder(local.is_some(), base.is_some(), remote.is_some());

            self.add_level(
                id,
                &Level {
                    local,
                    base,
                    remote: remote.map(|f| &**f),
                },
            );
        }

        for name in &files {
            let id = self.push(parent, name, false);
            let node = &mut self.nodes[id.0];
            node.local = level
                .local
                .and_then(|l| l.files.get(*name))
                .map(|e| (*e).clone());
            node.base = level
                .base
                .and_then(|b| b.files.get(*name))
                .map(|e| (*e).clone());
            node.remote = level
                .remote
                .and_then(|r| r.child(name))
                .and_then(RemoteResource::as_file)
                .map(|f| RemoteResource::File(Arc::clone(f)));
        }
    }

    fn push(&mut self, parent: NodeId, name: &str, is_folder: bool) -> NodeId {
        let parent_path = &self.nodes[parent.0].path;
        let path = if parent_path.is_empty() {
            name.to_string()
        } else {
            format!("{parent_path}/{name}")
        };

        let id = NodeId(self.nodes.len());
        self.nodes.push(DiffNode {
            name: name.to_string(),
            path,
            is_folder,
            kind: SyncKind::IN_SYNC,
            local_folder: false,
            had_base: false,
            local: None,
            base: None,
            remote: None,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Remote files whose classification will need their content
    #[must_use]
    pub fn content_candidates(&self, classifier: &Classifier<'_>) -> Vec<Arc<RemoteFile>> {
        self.nodes
            .iter()
            .filter(|n| !n.is_folder)
            .filter_map(|node| {
                let remote = node.remote_file()?;
                let base = node.base_lookup();
                let (local, remote_state) =
                    classifier.observe(node.local.as_ref(), base, Some(remote));
                needs_content(local, BaseStatus::from(base), remote_state)
                    .then(|| Arc::clone(remote))
            })
            .collect()
    }

    /// Classify every file node.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] if the monitor asks to stop, or the first
    /// classification failure.
    pub async fn classify_files(
        &mut self,
        classifier: &Classifier<'_>,
        monitor: &dyn Monitor,
    ) -> Result<()> {
        for index in 0..self.nodes.len() {
            if self.nodes[index].is_folder {
                continue;
            }
            if monitor.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let kind = self.classify_node(NodeId(index), classifier, monitor).await?;
            self.set_kind(NodeId(index), kind);
        }
        Ok(())
    }

    /// Classify one file node from its current observations
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] or a classification failure.
    pub async fn classify_node(
        &self,
        id: NodeId,
        classifier: &Classifier<'_>,
        monitor: &dyn Monitor,
    ) -> Result<SyncKind> {
        let node = self.node(id)?;
        if node.is_folder {
            return Ok(classify_folder(
                node.local_folder,
                node.had_base,
                node.remote.is_some(),
            ));
        }
        classifier
            .classify(
                node.local.as_ref(),
                node.base_lookup(),
                node.remote_file().map(|f| &**f),
                monitor,
            )
            .await
    }

    /// Assemble and classify in one go (no prefetching)
    ///
    /// # Errors
    /// See [`DiffTree::classify_files`].
    pub async fn build(
        local: &Snapshot,
        base: &BaseState,
        remote: Option<&Arc<RemoteFolder>>,
        classifier: &Classifier<'_>,
        monitor: &dyn Monitor,
    ) -> Result<Self> {
        let mut tree = Self::assemble(local, base, remote);
        tree.classify_files(classifier, monitor).await?;
        Ok(tree)
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Bumped whenever any classification changes
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn node(&self, id: NodeId) -> Result<&DiffNode> {
        self.nodes.get(id.0).ok_or(Error::UnknownNode(id.0))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut DiffNode> {
        self.nodes.get_mut(id.0).ok_or(Error::UnknownNode(id.0))
    }

    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.node(id)?.children)
    }

    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(id.0).and_then(|n| n.parent)
    }

    /// Node at a `/`-separated relative path; the empty path is the root
    #[must_use]
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let mut current = self.root();
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            current = *self.nodes[current.0]
                .children
                .iter()
                .find(|c| self.nodes[c.0].name == segment)?;
        }
        Some(current)
    }

    /// `id` and all its descendants in depth-first child order
    #[must_use]
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current.0) else {
                continue;
            };
            out.push(current);
            stack.extend(node.children.iter().rev());
        }
        out
    }

    /// File nodes at or below `id`, in depth-first child order
    #[must_use]
    pub fn leaves(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree(id)
            .into_iter()
            .filter(|n| !self.nodes[n.0].is_folder)
            .collect()
    }

    /// Set a node's own classification, bumping the generation on change.
    /// Unknown ids are ignored.
    pub fn set_kind(&mut self, id: NodeId, kind: SyncKind) {
        let Some(node) = self.nodes.get_mut(id.0) else {
            return;
        };
        if node.kind != kind {
            node.kind = kind;
            self.generation += 1;
        }
    }

    /// Replace the local observation of a file node
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn set_local(&mut self, id: NodeId, local: Option<FileEntry>) -> Result<()> {
        self.node_mut(id)?.local = local;
        Ok(())
    }

    /// Replace the baseline of a file node
    ///
    /// # Errors
    /// Returns [`Error::UnknownNode`] for ids from another tree.
    pub fn set_base(&mut self, id: NodeId, base: Option<BaseEntry>) -> Result<()> {
        self.node_mut(id)?.base = base;
        Ok(())
    }

    pub(crate) fn set_folder_state(&mut self, id: NodeId, local: bool, had_base: bool) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.local_folder = local;
            node.had_base = had_base;
        }
    }

    /// Record that a folder now exists locally
    pub(crate) fn mark_folder_local(&mut self, id: NodeId) {
        let mut current = Some(id);
        while let Some(node) = current.and_then(|c| self.nodes.get_mut(c.0)) {
            if node.local_folder {
                break;
            }
            node.local_folder = true;
            current = node.parent;
        }
    }

    /// Classification of a node including its descendants.
    ///
    /// Computed fresh on every call.
    #[must_use]
    pub fn aggregate(&self, id: NodeId) -> SyncKind {
        let Some(node) = self.nodes.get(id.0) else {
            return SyncKind::IN_SYNC;
        };
        if !node.is_folder {
            return node.kind;
        }
        SyncKind::aggregate(
            std::iter::once(node.kind).chain(node.children.iter().map(|c| self.aggregate(*c))),
        )
    }

    /// Aggregated classification of every node, indexed by [`NodeId::index`]
    #[must_use]
    pub fn aggregate_all(&self) -> Vec<SyncKind> {
        let mut kinds = vec![SyncKind::IN_SYNC; self.nodes.len()];
        // Children always have larger ids than their parent
        for index in (0..self.nodes.len()).rev() {
            let node = &self.nodes[index];
            kinds[index] = if node.is_folder {
                SyncKind::aggregate(
                    std::iter::once(node.kind).chain(node.children.iter().map(|c| kinds[c.0])),
                )
            } else {
                node.kind
            };
        }
        kinds
    }
}
