//! Bulk resolution of a subtree in one direction
//!
//! The resolver walks the subtree depth first in child order and handles one
//! file at a time. Cancellation is polled before every node; files already in
//! sync are skipped without any I/O. After each write the file is re-read
//! and reclassified, so a file that changed underneath us shows up as such.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::base::{BaseEntry, BaseState};
use crate::classify::{Classifier, SyncKind, classify_folder};
use crate::error::{Error, Result};
use crate::monitor::Monitor;
use crate::resource::RemoteFile;
use crate::scan::FileEntry;
use crate::tree::{DiffTree, NodeId};

/// Which side wins a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDirection {
    /// Copy remote content over local content
    RemoteWinsLocal,
    /// Keep local content and adopt it as the new baseline
    LocalWinsRemote,
}

/// What a resolution pass did
#[derive(Debug, Default)]
pub struct MergeReport {
    /// Files that ended up in sync
    pub resolved: Vec<(String, SyncKind)>,
    /// Files handled but still out of sync afterwards, with their new kind
    pub unsettled: Vec<(String, SyncKind)>,
    /// Nodes that could not be handled
    pub failed: Vec<(String, Error)>,
    /// Files never reached
    pub unvisited: Vec<String>,
    /// Files skipped because they were already in sync
    pub skipped: usize,
    pub cancelled: bool,
}

impl MergeReport {
    /// Every file was reached and ended up in sync
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.cancelled
            && self.failed.is_empty()
            && self.unvisited.is_empty()
            && self.unsettled.is_empty()
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.is_complete()
    }
}

/// Observations of one file captured before it is touched
struct Leaf {
    path: String,
    local: Option<FileEntry>,
    remote: Option<Arc<RemoteFile>>,
}

/// Resolve every out-of-sync file under `start` in `direction`.
///
/// Per-file failures are collected in the report and do not stop the pass.
/// Cancellation stops it before the next node and lists what was left.
///
/// # Errors
/// Returns [`Error::UnknownNode`] if `start` is not part of `tree`.
pub async fn resolve(
    tree: &mut DiffTree,
    start: NodeId,
    direction: MergeDirection,
    classifier: &Classifier<'_>,
    base: &mut BaseState,
    monitor: &dyn Monitor,
) -> Result<MergeReport> {
    tree.node(start)?;

    let order = tree.subtree(start);
    let mut report = MergeReport::default();
    let mut index = 0;

    info!(
        path = tree.node(start)?.path(),
        ?direction,
        nodes = order.len(),
        "resolving"
    );

    while index < order.len() {
        if monitor.is_cancelled() {
            report.cancelled = true;
            report.unvisited.extend(leaf_paths(tree, &order[index..]));
            info!(unvisited = report.unvisited.len(), "resolution cancelled");
            break;
        }

        let id = order[index];
        let node = tree.node(id)?;

        if node.is_folder() {
            let size = tree.subtree(id).len();
            if let Err(err) = prepare_folder(tree, id, direction, classifier).await {
                warn!(path = tree.node(id)?.path(), "folder failed: {err}");
                report.failed.push((tree.node(id)?.path().to_string(), err));
                report
                    .unvisited
                    .extend(leaf_paths(tree, &order[index + 1..index + size]));
                index += size;
                continue;
            }
            index += 1;
            continue;
        }

        if node.kind().is_in_sync() {
            report.skipped += 1;
            monitor.worked(1);
            index += 1;
            continue;
        }

        let leaf = Leaf {
            path: node.path().to_string(),
            local: node.local().cloned(),
            remote: node.remote_file().cloned(),
        };
        monitor.sub_task(&leaf.path);

        match resolve_leaf(tree, id, &leaf, direction, classifier, base, monitor).await {
            Ok(kind) if kind.is_in_sync() => {
                debug!(path = %leaf.path, "resolved");
                report.resolved.push((leaf.path, kind));
            }
            Ok(kind) => {
                debug!(path = %leaf.path, %kind, "still out of sync");
                report.unsettled.push((leaf.path, kind));
            }
            Err(err) => {
                warn!(path = %leaf.path, "could not resolve: {err}");
                report.failed.push((leaf.path, err));
            }
        }
        monitor.worked(1);
        index += 1;
    }

    refresh_folders(tree, start);
    info!(
        resolved = report.resolved.len(),
        unsettled = report.unsettled.len(),
        failed = report.failed.len(),
        skipped = report.skipped,
        "resolution finished"
    );
    Ok(report)
}

fn leaf_paths(tree: &DiffTree, ids: &[NodeId]) -> Vec<String> {
    ids.iter()
        .filter_map(|id| tree.node(*id).ok())
        .filter(|n| !n.is_folder())
        .map(|n| n.path().to_string())
        .collect()
}

/// Materialize a remote-only folder before its files are copied in
async fn prepare_folder(
    tree: &mut DiffTree,
    id: NodeId,
    direction: MergeDirection,
    classifier: &Classifier<'_>,
) -> Result<()> {
    let node = tree.node(id)?;
    if direction != MergeDirection::RemoteWinsLocal
        || node.exists_locally()
        || node.remote().is_none()
    {
        return Ok(());
    }

    classifier.workspace().create_dir(&node.local_path()).await?;
    tree.mark_folder_local(id);
    Ok(())
}

async fn resolve_leaf(
    tree: &mut DiffTree,
    id: NodeId,
    leaf: &Leaf,
    direction: MergeDirection,
    classifier: &Classifier<'_>,
    base: &mut BaseState,
    monitor: &dyn Monitor,
) -> Result<SyncKind> {
    let workspace = classifier.workspace();
    let local_path = tree.node(id)?.local_path();

    let (local, new_base) = match direction {
        MergeDirection::RemoteWinsLocal => match &leaf.remote {
            Some(remote) => {
                let contents = remote
                    .fetch_content(classifier.transport(), None, monitor)
                    .await?;
                workspace.write(&local_path, &contents).await?;
                if let Some(parent) = tree.parent(id) {
                    tree.mark_folder_local(parent);
                }

                let written = workspace
                    .stat(&local_path)
                    .await?
                    .ok_or_else(|| Error::workspace(&local_path, "file vanished after write"))?;
                let entry = BaseEntry::from_entry(&written, remote.revision());
                (Some(written), Some(entry))
            }
            None => {
                workspace.delete(&local_path).await?;
                let remaining = workspace.stat(&local_path).await?;
                (remaining, None)
            }
        },
        MergeDirection::LocalWinsRemote => {
            let current = workspace.stat(&local_path).await?;
            let entry = match (&current, &leaf.remote) {
                (Some(local), Some(remote)) => Some(BaseEntry::from_entry(local, remote.revision())),
                _ => None,
            };
            (current, entry)
        }
    };

    match &new_base {
        Some(entry) => base.record(leaf.path.clone(), entry.clone()),
        None => {
            base.remove(&leaf.path);
        }
    }
    if local.is_none() && leaf.local.is_some() {
        debug!(path = %leaf.path, "local file removed");
    }

    tree.set_local(id, local)?;
    tree.set_base(id, new_base)?;
    let kind = tree.classify_node(id, classifier, monitor).await?;
    tree.set_kind(id, kind);
    Ok(kind)
}

/// Recompute folder existence and kinds under `start` after files moved
fn refresh_folders(tree: &mut DiffTree, start: NodeId) {
    let folders: Vec<NodeId> = tree
        .subtree(start)
        .into_iter()
        .filter(|id| tree.node(*id).is_ok_and(|n| n.is_folder()))
        .collect();

    for id in folders.into_iter().rev() {
        let Ok(node) = tree.node(id) else { continue };
        if node.parent().is_none() {
            continue;
        }
        let children: Vec<_> = node
            .children()
            .iter()
            .filter_map(|c| tree.node(*c).ok())
            .collect();

        let local = if children.is_empty() {
            node.exists_locally()
        } else {
            children.iter().any(|c| c.exists_locally())
        };
        let had_base = if children.is_empty() {
            node.had_base()
        } else {
            children.iter().any(|c| c.had_base())
        };
        let remote = node.remote().is_some();

        tree.set_folder_state(id, local, had_base);
        tree.set_kind(id, classify_folder(local, had_base, remote));
    }
}

/// Force `node` and everything beneath it to in-sync without any I/O
///
/// # Errors
/// Returns [`Error::UnknownNode`] if `node` is not part of `tree`.
pub fn mark_resolved(tree: &mut DiffTree, node: NodeId) -> Result<()> {
    tree.node(node)?;
    for id in tree.subtree(node) {
        tree.set_kind(id, SyncKind::IN_SYNC);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{Change, CompareConfig};
    use crate::hash::ContentHash;
    use crate::monitor::NullMonitor;
    use crate::resource::{RemoteFolder, Tag};
    use crate::testing::{CancelAfter, FakeTransport, MemoryWorkspace};
    use crate::transport::RepositoryLocation;
    use crate::workspace::Workspace;

    fn base_entry(content: &[u8], revision: &str, mtime_secs: i64) -> BaseEntry {
        BaseEntry {
            revision: revision.to_string(),
            hash: *ContentHash::from_bytes(content).as_bytes(),
            mtime_secs,
            size: content.len() as u64,
        }
    }

    async fn build(
        transport: &FakeTransport,
        workspace: &MemoryWorkspace,
        base: &BaseState,
    ) -> DiffTree {
        let remote = RemoteFolder::fetch(
            transport,
            &RepositoryLocation::local("/repo"),
            Vec::new(),
            &Tag::Head,
            &NullMonitor,
        )
        .await
        .unwrap();
        let local = workspace.scan().await.unwrap();
        let classifier = Classifier::new(transport, workspace, CompareConfig::default());
        DiffTree::build(
            &local,
            base,
            Some(&Arc::new(remote)),
            &classifier,
            &NullMonitor,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_remote_wins_copies_incoming_change() {
        let transport = FakeTransport::new()
            .with_file("a.txt", "1.1", b"v1")
            .with_file("a.txt", "1.2", b"v2");
        let workspace = MemoryWorkspace::new().with_file("a.txt", b"v1", 1_000);
        let mut base = BaseState::default();
        base.record("a.txt", base_entry(b"v1", "1.1", 1_000));

        let mut tree = build(&transport, &workspace, &base).await;
        let a = tree.find("a.txt").unwrap();
        assert_eq!(tree.node(a).unwrap().kind(), SyncKind::incoming(Change::Changed));

        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::RemoteWinsLocal,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert!(report.is_complete());
        assert_eq!(report.resolved, vec![("a.txt".to_string(), SyncKind::IN_SYNC)]);
        assert_eq!(workspace.contents("a.txt").unwrap(), b"v2");
        assert_eq!(base.get("a.txt").unwrap().revision, "1.2");
        assert_eq!(
            base.get("a.txt").unwrap().content_hash(),
            ContentHash::from_bytes(b"v2")
        );
        assert!(tree.aggregate(root).is_in_sync());
    }

    #[tokio::test]
    async fn test_remote_wins_deletes_and_creates() {
        let transport = FakeTransport::new().with_file("docs/new.txt", "1.1", b"new");
        let workspace = MemoryWorkspace::new().with_file("gone.txt", b"g", 1_000);
        let mut base = BaseState::default();
        base.record("gone.txt", base_entry(b"g", "1.1", 1_000));

        let mut tree = build(&transport, &workspace, &base).await;
        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::RemoteWinsLocal,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert!(report.is_complete(), "{report:?}");
        assert!(workspace.contents("gone.txt").is_none());
        assert!(base.get("gone.txt").is_none());
        assert_eq!(workspace.contents("docs/new.txt").unwrap(), b"new");
        assert!(tree.aggregate(root).is_in_sync());
    }

    #[tokio::test]
    async fn test_local_wins_adopts_local_baseline() {
        let transport = FakeTransport::new().with_file("a.txt", "1.1", b"v1");
        let workspace = MemoryWorkspace::new().with_file("a.txt", b"mine", 2_000);
        let mut base = BaseState::default();
        base.record("a.txt", base_entry(b"v1", "1.1", 1_000));

        let mut tree = build(&transport, &workspace, &base).await;
        let a = tree.find("a.txt").unwrap();
        assert_eq!(tree.node(a).unwrap().kind(), SyncKind::outgoing(Change::Changed));

        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let report = resolve(
            &mut tree,
            a,
            MergeDirection::LocalWinsRemote,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert!(report.is_complete());
        assert_eq!(workspace.contents("a.txt").unwrap(), b"mine");
        let baseline = base.get("a.txt").unwrap();
        assert_eq!(baseline.content_hash(), ContentHash::from_bytes(b"mine"));
        assert_eq!(baseline.revision, "1.1");
        assert_eq!(tree.node(a).unwrap().kind(), SyncKind::IN_SYNC);
        assert_eq!(transport.update_count(), 0);
    }

    #[tokio::test]
    async fn test_in_sync_leaves_cause_no_io() {
        let transport = FakeTransport::new().with_file("a.txt", "1.1", b"v1");
        let workspace = MemoryWorkspace::new().with_file("a.txt", b"v1", 1_000);
        let mut base = BaseState::default();
        base.record("a.txt", base_entry(b"v1", "1.1", 1_000));

        let mut tree = build(&transport, &workspace, &base).await;
        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::RemoteWinsLocal,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert_eq!(report.skipped, 1);
        assert!(report.resolved.is_empty());
        assert_eq!(transport.update_count(), 0);
        assert_eq!(workspace.write_count(), 0);
        assert_eq!(base.version, 1);
    }

    #[tokio::test]
    async fn test_local_wins_without_local_file_stays_unsettled() {
        let transport = FakeTransport::new().with_file("new.txt", "1.1", b"new");
        let workspace = MemoryWorkspace::new();
        let mut base = BaseState::default();

        let mut tree = build(&transport, &workspace, &base).await;
        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::LocalWinsRemote,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert!(report.resolved.is_empty());
        assert_eq!(
            report.unsettled,
            vec![("new.txt".to_string(), SyncKind::incoming(Change::Added))]
        );
        assert!(report.is_partial());
        assert!(!report.cancelled);
        assert_eq!(workspace.write_count(), 0);
        assert_eq!(transport.update_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_two_leaves() {
        let mut transport = FakeTransport::new();
        for name in ["f1", "f2", "f3", "f4", "f5"] {
            transport = transport.with_file(name, "1.1", name.as_bytes());
        }
        let workspace = MemoryWorkspace::new();
        let mut base = BaseState::default();

        let mut tree = build(&transport, &workspace, &base).await;
        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let monitor = CancelAfter::new(2);
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::RemoteWinsLocal,
            &classifier,
            &mut base,
            &monitor,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert!(report.is_partial());
        assert_eq!(report.resolved.len(), 2);
        assert_eq!(report.unvisited, vec!["f3", "f4", "f5"]);
        assert!(workspace.contents("f2").is_some());
        assert!(workspace.contents("f3").is_none());
        let f3 = tree.find("f3").unwrap();
        assert_eq!(tree.node(f3).unwrap().kind(), SyncKind::incoming(Change::Added));
    }

    #[tokio::test]
    async fn test_failures_are_collected_and_pass_continues() {
        let transport = FakeTransport::new()
            .with_file("a.txt", "1.1", b"a")
            .with_file("b.txt", "1.1", b"b");
        let workspace = MemoryWorkspace::new();
        workspace.fail_writes_to("a.txt");
        let mut base = BaseState::default();

        let mut tree = build(&transport, &workspace, &base).await;
        let classifier = Classifier::new(&transport, &workspace, CompareConfig::default());
        let root = tree.root();
        let report = resolve(
            &mut tree,
            root,
            MergeDirection::RemoteWinsLocal,
            &classifier,
            &mut base,
            &NullMonitor,
        )
        .await
        .unwrap();

        assert!(!report.cancelled);
        assert!(report.is_partial());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a.txt");
        assert!(matches!(report.failed[0].1, Error::Workspace { .. }));
        assert_eq!(report.resolved.len(), 1);
        let a = tree.find("a.txt").unwrap();
        assert_eq!(tree.node(a).unwrap().kind(), SyncKind::incoming(Change::Added));
    }

    #[tokio::test]
    async fn test_mark_resolved_forces_subtree() {
        let transport = FakeTransport::new()
            .with_file("src/a.txt", "1.1", b"a")
            .with_file("src/b.txt", "1.1", b"b");
        let workspace = MemoryWorkspace::new();
        let base = BaseState::default();

        let mut tree = build(&transport, &workspace, &base).await;
        let src = tree.find("src").unwrap();
        assert!(!tree.aggregate(src).is_in_sync());

        mark_resolved(&mut tree, src).unwrap();
        assert!(tree.aggregate(src).is_in_sync());
        assert!(tree.aggregate(tree.root()).is_in_sync());
        assert_eq!(workspace.contents("src/a.txt"), None);
    }
}
