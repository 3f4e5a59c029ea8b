//! End-to-end synchronization against an on-disk repository and working tree

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use catchup_core::{
    BaseState, Change, CompareConfig, Direction, FilterMask, FilterToggles, Granularity,
    MergeDirection, Monitor, NullMonitor, Session, SessionOptions, SyncMode,
};
use catchup_transport::{LocalRepository, LocalWorkspace};
use filetime::FileTime;
use tempfile::TempDir;

struct Fixture {
    _repo_dir: TempDir,
    work_dir: TempDir,
    repo: Arc<LocalRepository>,
    workspace: Arc<LocalWorkspace>,
}

impl Fixture {
    fn new() -> Self {
        let repo_dir = TempDir::new().unwrap();
        let work_dir = TempDir::new().unwrap();
        let repo = Arc::new(LocalRepository::create(repo_dir.path()).unwrap());
        let workspace = Arc::new(LocalWorkspace::new(work_dir.path()).unwrap());
        Self {
            _repo_dir: repo_dir,
            work_dir,
            repo,
            workspace,
        }
    }

    fn root(&self) -> &Path {
        self.work_dir.path()
    }

    fn read(&self, path: &str) -> String {
        std::fs::read_to_string(self.root().join(path)).unwrap()
    }

    async fn open(&self, compare: CompareConfig) -> Session {
        let options = SessionOptions {
            compare,
            ..SessionOptions::new(self.repo.location())
        };
        Session::open(
            self.repo.clone(),
            self.workspace.clone(),
            BaseState::load(self.root()).unwrap(),
            options,
            &NullMonitor,
        )
        .await
        .unwrap()
    }

    /// Open a session and bring the working tree level with the repository
    async fn synced(&self, compare: CompareConfig) -> Session {
        let mut session = self.open(compare).await;
        let root = session.root();
        let report = session
            .resolve(root, MergeDirection::RemoteWinsLocal, &NullMonitor)
            .await
            .unwrap();
        assert!(report.is_complete(), "initial sync failed: {report:?}");
        session.base_state().save(self.root()).unwrap();
        session
    }
}

/// Cancels once `limit` units of work have been reported
struct CancelAfter {
    limit: u64,
    worked: AtomicU64,
    cancelled: AtomicBool,
}

impl CancelAfter {
    fn new(limit: u64) -> Self {
        Self {
            limit,
            worked: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Monitor for CancelAfter {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn worked(&self, units: u64) {
        let total = self.worked.fetch_add(units, Ordering::SeqCst) + units;
        if total >= self.limit {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    fn sub_task(&self, _label: &str) {}
}

#[tokio::test]
async fn test_incoming_change_is_fetched() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"v1\n", "first").unwrap();
    fx.synced(CompareConfig::default()).await;
    assert_eq!(fx.read("a.txt"), "v1\n");

    fx.repo.check_in("a.txt", b"v2\n", "second").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;

    let node = session.find("a.txt").unwrap();
    let kind = session.classification(node).unwrap();
    assert_eq!(kind.change(), Change::Changed);
    assert_eq!(kind.direction(), Some(Direction::Incoming));

    let report = session
        .resolve(node, MergeDirection::RemoteWinsLocal, &NullMonitor)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(fx.read("a.txt"), "v2\n");
    assert_eq!(session.base_state().get("a.txt").unwrap().revision, "1.2");

    session.refresh(&NullMonitor).await.unwrap();
    let root = session.root();
    assert!(session.classification(root).unwrap().is_in_sync());
}

#[tokio::test]
async fn test_base_survives_restart() {
    let fx = Fixture::new();
    fx.repo.check_in("src/lib.rs", b"lib\n", "").unwrap();
    fx.repo.check_in("README", b"readme\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    let session = fx.open(CompareConfig::default()).await;
    let root = session.root();
    assert!(session.classification(root).unwrap().is_in_sync());
    assert_eq!(session.base_state().len(), 2);
}

#[tokio::test]
async fn test_local_edit_adopted_as_base() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"v1\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    std::fs::write(fx.root().join("a.txt"), "mine\n").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;

    let node = session.find("a.txt").unwrap();
    let kind = session.classification(node).unwrap();
    assert_eq!(kind.change(), Change::Changed);
    assert_eq!(kind.direction(), Some(Direction::Outgoing));

    let report = session
        .resolve(node, MergeDirection::LocalWinsRemote, &NullMonitor)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(fx.read("a.txt"), "mine\n");

    session.refresh(&NullMonitor).await.unwrap();
    let node = session.find("a.txt").unwrap();
    assert!(session.classification(node).unwrap().is_in_sync());
}

#[tokio::test]
async fn test_identical_edits_are_pseudo_conflict() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"v1\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    std::fs::write(fx.root().join("a.txt"), "same\n").unwrap();
    fx.repo.check_in("a.txt", b"same\n", "").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;

    let node = session.find("a.txt").unwrap();
    let kind = session.classification(node).unwrap();
    assert!(kind.is_pseudo_conflict());

    let compare = FilterMask::for_mode(SyncMode::Compare, FilterToggles::default());
    assert!(!session.is_visible(node, compare));

    let both = FilterMask::for_mode(SyncMode::Both, FilterToggles::default());
    assert!(session.is_visible(node, both));
}

#[tokio::test]
async fn test_real_conflict_is_always_visible() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"v1\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    std::fs::write(fx.root().join("a.txt"), "local\n").unwrap();
    fx.repo.check_in("a.txt", b"remote\n", "").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;

    let node = session.find("a.txt").unwrap();
    let kind = session.classification(node).unwrap();
    assert!(kind.is_conflict());
    assert!(!kind.is_pseudo_conflict());

    let toggles = FilterToggles {
        incoming: false,
        outgoing: false,
        conflicts_only: true,
    };
    assert!(session.is_visible(node, FilterMask::for_mode(SyncMode::Compare, toggles)));
}

#[tokio::test]
async fn test_remote_removal_deletes_local_file() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"a\n", "").unwrap();
    fx.repo.check_in("b.txt", b"b\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    fx.repo.remove("a.txt").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;

    let node = session.find("a.txt").unwrap();
    let kind = session.classification(node).unwrap();
    assert_eq!(kind.change(), Change::Removed);
    assert_eq!(kind.direction(), Some(Direction::Incoming));

    let report = session
        .resolve(node, MergeDirection::RemoteWinsLocal, &NullMonitor)
        .await
        .unwrap();
    assert!(report.is_complete());
    assert!(!fx.root().join("a.txt").exists());
    assert!(session.base_state().get("a.txt").is_none());
}

#[tokio::test]
async fn test_removing_last_file_of_folder_settles() {
    let fx = Fixture::new();
    fx.repo.check_in("src/a.txt", b"a\n", "").unwrap();
    fx.repo.check_in("b.txt", b"b\n", "").unwrap();
    fx.synced(CompareConfig::default()).await;

    fx.repo.remove("src/a.txt").unwrap();
    let mut session = fx.open(CompareConfig::default()).await;
    let root = session.root();
    let report = session
        .resolve(root, MergeDirection::RemoteWinsLocal, &NullMonitor)
        .await
        .unwrap();
    assert!(report.is_complete(), "{report:?}");
    session.base_state().save(fx.root()).unwrap();
    assert!(!fx.root().join("src/a.txt").exists());

    for _ in 0..2 {
        let session = fx.open(CompareConfig::default()).await;
        let root = session.root();
        assert!(
            session.classification(root).unwrap().is_in_sync(),
            "root shows {}",
            session.classification(root).unwrap()
        );
        assert!(session.find("src").is_none());
    }
}

#[tokio::test]
async fn test_cancel_after_two_of_five() {
    let fx = Fixture::new();
    for i in 1..=5 {
        fx.repo
            .check_in(&format!("f{i}"), format!("{i}\n").as_bytes(), "")
            .unwrap();
    }
    let mut session = fx.open(CompareConfig::default()).await;

    let monitor = CancelAfter::new(2);
    let root = session.root();
    let report = session
        .resolve(root, MergeDirection::RemoteWinsLocal, &monitor)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.is_partial());
    assert_eq!(report.resolved.len(), 2);
    assert_eq!(report.unvisited, vec!["f3", "f4", "f5"]);
    assert!(fx.root().join("f2").exists());
    assert!(!fx.root().join("f3").exists());
}

#[tokio::test]
async fn test_timestamp_granularity_trusts_mtime() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"v1\n", "").unwrap();
    let session = fx.synced(CompareConfig::default()).await;
    let base_mtime = session.base_state().get("a.txt").unwrap().mtime_secs;

    let path = fx.root().join("a.txt");
    std::fs::write(&path, "edited\n").unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(base_mtime, 0)).unwrap();

    let by_time = CompareConfig {
        granularity: Granularity::Timestamp,
        ..CompareConfig::default()
    };
    let session = fx.open(by_time).await;
    let node = session.find("a.txt").unwrap();
    assert!(session.classification(node).unwrap().is_in_sync());

    let session = fx.open(CompareConfig::default()).await;
    let node = session.find("a.txt").unwrap();
    assert_eq!(
        session.classification(node).unwrap().direction(),
        Some(Direction::Outgoing)
    );
}

#[tokio::test]
async fn test_config_file_is_not_synchronized() {
    let fx = Fixture::new();
    fx.repo.check_in("a.txt", b"a\n", "").unwrap();
    std::fs::write(fx.root().join(".catchup.toml"), "mode = \"merge\"\n").unwrap();

    let session = fx.open(CompareConfig::default()).await;
    assert!(session.find(".catchup.toml").is_none());
    assert!(session.find("a.txt").is_some());
}
