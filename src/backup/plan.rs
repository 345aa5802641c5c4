//! Pass 1: inquire and partition every enabled module into a [`Plan`].

use super::context::RunningContexts;
use super::dir::{DirId, DirTree};
use super::inquiry::{inquire_dir_tree, DirLister};
use super::notifier::PlanObserver;
use super::partition::BlockPartitioner;
use super::snapshot::module_signature;
use super::types::{FolderBackupType, FolderSize, SizeProgress, SrcDstPath};
use crate::error::{BackupError, Result};
use crate::utils::config::{Config, Module};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Lowest completion fraction reported once a session has started.
pub const MIN_FRACTION: f64 = 0.001;

/// One rsync invocation of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: DirId,
    pub paths: SrcDstPath,
    pub backup_type: FolderBackupType,
    /// False when only the folder's own files are sent
    pub recursive: bool,
    /// Bytes this block is expected to move
    pub predicted_size: FolderSize,
    /// Folders left to other blocks or ignored, relative to this one
    pub excludes: Vec<String>,
}

/// The partitioned tree of one module.
#[derive(Debug, Clone)]
pub struct Node {
    pub index: usize,
    pub module: Module,
    pub tree: DirTree,
    pub signature: String,
    pub total_size: FolderSize,
    pub ignore_size: FolderSize,
    pub folders_count: usize,
}

impl Node {
    fn new(index: usize, module: Module, tree: DirTree) -> Self {
        Self {
            index,
            signature: module_signature(&module),
            total_size: tree.total_size(),
            ignore_size: tree.ignore_size(),
            folders_count: tree.folders_count(),
            module,
            tree,
        }
    }

    /// Blocks in pre-order, parents before children.
    pub fn blocks(&self) -> Vec<Block> {
        self.tree
            .spans()
            .into_iter()
            .map(|span| Block {
                id: span.id,
                paths: self.tree.get(span.id).paths.clone(),
                backup_type: span.backup_type,
                recursive: span.recursive,
                predicted_size: span.size,
                excludes: span.excludes,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    pub config: Arc<Config>,
    pub nodes: Vec<Node>,
}

impl Plan {
    /// Bytes the whole plan is expected to transfer.
    pub fn total_size(&self) -> FolderSize {
        self.nodes.iter().map(|n| n.total_size).sum()
    }

    pub fn ignore_size(&self) -> FolderSize {
        self.nodes.iter().map(|n| n.ignore_size).sum()
    }

    pub fn folders_count(&self) -> usize {
        self.nodes.iter().map(|n| n.folders_count).sum()
    }

    pub fn block_count(&self) -> usize {
        self.nodes.iter().map(|n| n.blocks().len()).sum()
    }

    /// One signature per module, in plan order.
    pub fn signatures(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.signature.clone()).collect()
    }
}

/// Running totals of one session. Owned by the session; observers get copies.
#[derive(Debug, Clone)]
pub struct Progress {
    pub total_progress: SizeProgress,
    started: Option<Instant>,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
    pub fraction: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            total_progress: SizeProgress::default(),
            started: None,
            elapsed: Duration::ZERO,
            eta: None,
            fraction: 0.0,
        }
    }

    pub(crate) fn start(&mut self) {
        self.started = Some(Instant::now());
        self.fraction = MIN_FRACTION;
    }

    pub fn done(&self) -> FolderSize {
        self.total_progress.total()
    }

    pub fn bytes_left(&self, plan_total: FolderSize) -> FolderSize {
        plan_total.saturating_sub(self.done())
    }

    pub(crate) fn add(&mut self, delta: &SizeProgress, plan_total: FolderSize) {
        self.total_progress = self.total_progress.add(delta);
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.recompute(plan_total, elapsed);
    }

    /// Refreshes elapsed time and ETA without new bytes.
    pub(crate) fn tick(&mut self, plan_total: FolderSize) {
        let elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.recompute(plan_total, elapsed);
    }

    fn recompute(&mut self, plan_total: FolderSize, elapsed: Duration) {
        let done = self.done().bytes();
        let left = self.bytes_left(plan_total).bytes();
        self.elapsed = elapsed;

        self.fraction = if done + left == 0 {
            1.0
        } else {
            (done as f64 / (done + left) as f64).clamp(MIN_FRACTION, 1.0)
        };

        self.eta = if done == 0 {
            None
        } else {
            let secs = elapsed.as_secs_f64() * left as f64 / done as f64;
            Some(Duration::from_secs_f64(secs))
        };
    }
}

fn module_paths(module: &Module) -> SrcDstPath {
    let src = module.source_rsync.trim_end_matches('/');
    // keep "/" and "host::" style roots usable
    let src = if src.is_empty() { "/" } else { src };
    SrcDstPath::new(src, module.dest_subpath.trim_matches('/'))
}

/// Inquires and partitions every enabled module, in configuration order.
///
/// Stops at the first inquiry error. A cancelled `cancel` yields
/// [`BackupError::ProcessTerminated`].
pub async fn build_backup_plan(
    lister: &dyn DirLister,
    config: Arc<Config>,
    observer: &dyn PlanObserver,
    cancel: &CancellationToken,
) -> Result<(Plan, Progress)> {
    let partitioner = BlockPartitioner::from_config(&config);
    let mut nodes = Vec::new();

    for (index, module) in config.enabled_modules().enumerate() {
        if cancel.is_cancelled() {
            return Err(BackupError::ProcessTerminated);
        }

        let source = module.source_rsync.as_str();
        observer.node_structure_start_inquiry(index, source);

        let mut tree = inquire_dir_tree(
            lister,
            module_paths(module),
            &config.ignore_signature_file,
            module.auth_password.as_deref(),
            cancel,
        )
        .await?;
        partitioner.partition(&mut tree);

        observer.node_structure_done_inquiry(index, source, &tree);
        nodes.push(Node::new(index, module.clone(), tree));
    }

    let plan = Plan { config, nodes };
    info!(
        "Plan ready: {} modules, {} folders, {} blocks, {} to back up, {} ignored",
        plan.nodes.len(),
        plan.folders_count(),
        plan.block_count(),
        plan.total_size(),
        plan.ignore_size()
    );
    Ok((plan, Progress::new()))
}

/// Checks that a module source can be listed, under its own context forked
/// from `parent` and registered in `contexts` while it runs.
pub async fn probe_module_source(
    contexts: &RunningContexts,
    parent: &CancellationToken,
    lister: &dyn DirLister,
    module: &Module,
) -> Result<usize> {
    let guard = contexts.fork(parent);
    let paths = module_paths(module);
    debug!("Probing {} ({})", paths.src, guard.id());
    let entries = lister
        .list(&paths.src, module.auth_password.as_deref(), guard.token())
        .await?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::inquiry::tests::{file, folder, FakeLister};
    use crate::backup::rsync_output::ListEntry;
    use crate::utils::config::MB;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl PlanObserver for Recorder {
        fn node_structure_start_inquiry(&self, index: usize, source: &str) {
            self.events.lock().push(format!("start {} {}", index, source));
        }

        fn node_structure_done_inquiry(&self, index: usize, source: &str, tree: &DirTree) {
            self.events
                .lock()
                .push(format!("done {} {} {}", index, source, tree.len()));
        }
    }

    fn config(modules: Vec<Module>) -> Arc<Config> {
        Arc::new(Config {
            min_block_size: 300 * MB,
            max_block_size: 1000 * MB,
            modules,
            ..Config::default()
        })
    }

    fn lister() -> FakeLister {
        FakeLister::default()
            .dir(
                "/data/home",
                vec![folder("alice"), folder("bob"), file("notes", 10 * MB)],
            )
            .dir("/data/home/alice", vec![file("a", 600 * MB), folder("tmp")])
            .dir("/data/home/alice/tmp", vec![file(".rsync_backup_skip", 0), file("t", 50 * MB)])
            .dir("/data/home/bob", vec![file("b", 700 * MB)])
            .dir("/data/mail", vec![file("m", 5 * MB)])
    }

    #[tokio::test]
    async fn test_plan_over_modules() {
        let mut disabled = Module::new("/data/off", "off");
        disabled.enabled = false;
        let cfg = config(vec![
            Module::new("/data/home/", "home"),
            disabled,
            Module::new("/data/mail", "mail"),
        ]);
        let recorder = Recorder::default();

        let (plan, progress) = build_backup_plan(&lister(), cfg, &recorder, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *recorder.events.lock(),
            vec![
                "start 0 /data/home/",
                "done 0 /data/home/ 4",
                "start 1 /data/mail",
                "done 1 /data/mail 1",
            ]
        );
        assert_eq!(plan.nodes.len(), 2);
        assert!(progress.total_progress.is_empty());

        let home = &plan.nodes[0];
        assert_eq!(home.total_size, FolderSize(1310 * MB));
        assert_eq!(home.ignore_size, FolderSize(50 * MB));
        assert_eq!(home.folders_count, 3);

        let blocks = home.blocks();
        let kinds: Vec<_> = blocks
            .iter()
            .map(|b| (b.paths.dst.as_str(), b.backup_type))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("home", FolderBackupType::ContentOnly),
                ("home/alice", FolderBackupType::RecurseFully),
                ("home/bob", FolderBackupType::RecurseFully),
            ]
        );
        assert!(!blocks[0].recursive);
        assert_eq!(blocks[1].excludes, vec!["tmp"]);
        assert_eq!(blocks[1].predicted_size, FolderSize(600 * MB));
        let predicted: FolderSize = blocks.iter().map(|b| b.predicted_size).sum();
        assert_eq!(predicted, home.total_size);

        assert_eq!(plan.nodes[1].blocks().len(), 1);
        assert_eq!(plan.total_size(), FolderSize(1315 * MB));
        assert_eq!(plan.signatures().len(), 2);
    }

    #[tokio::test]
    async fn test_first_inquiry_error_aborts() {
        let cfg = config(vec![
            Module::new("/data/missing", "x"),
            Module::new("/data/mail", "mail"),
        ]);
        let recorder = Recorder::default();
        let err = build_backup_plan(&lister(), cfg, &recorder, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotADirectory(_)));
        assert_eq!(recorder.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_plan_is_terminated() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = build_backup_plan(
            &lister(),
            config(vec![Module::new("/data/mail", "mail")]),
            &crate::backup::notifier::NoopObserver,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_terminated());
    }

    #[test]
    fn test_progress_eta_and_fraction() {
        let total = FolderSize(1000);
        let mut progress = Progress::new();
        progress.start();
        progress.recompute(total, Duration::from_secs(10));
        assert_eq!(progress.eta, None);
        assert_eq!(progress.fraction, MIN_FRACTION);

        progress.total_progress = SizeProgress::completed(FolderSize(250));
        progress.recompute(total, Duration::from_secs(10));
        assert_eq!(progress.bytes_left(total), FolderSize(750));
        assert_eq!(progress.eta, Some(Duration::from_secs(30)));
        assert!((progress.fraction - 0.25).abs() < 1e-9);

        progress.total_progress = progress.total_progress.add(&SizeProgress::failed(FolderSize(900)));
        progress.recompute(total, Duration::from_secs(20));
        assert_eq!(progress.bytes_left(total), FolderSize::ZERO);
        assert_eq!(progress.eta, Some(Duration::ZERO));
        assert_eq!(progress.fraction, 1.0);
    }

    struct BlockingLister;

    #[async_trait]
    impl DirLister for BlockingLister {
        async fn list(&self, _path: &str, _auth: Option<&str>, cancel: &CancellationToken) -> Result<Vec<ListEntry>> {
            cancel.cancelled().await;
            Err(BackupError::ProcessTerminated)
        }

        async fn measure(&self, _path: &str, _auth: Option<&str>, _cancel: &CancellationToken) -> Result<FolderSize> {
            Ok(FolderSize::ZERO)
        }
    }

    #[tokio::test]
    async fn test_probe_registers_and_cancels() {
        let contexts = RunningContexts::new();
        let parent = CancellationToken::new();
        let module = Module::new("backup@nas::home", "home");

        let probe = {
            let contexts = contexts.clone();
            let parent = parent.clone();
            tokio::spawn(async move {
                probe_module_source(&contexts, &parent, &BlockingLister, &module).await
            })
        };
        while contexts.is_empty() {
            tokio::task::yield_now().await;
        }
        contexts.cancel_all();
        let err = probe.await.unwrap().unwrap_err();
        assert!(err.is_terminated());
        assert!(contexts.is_empty());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_probe_counts_entries() {
        let contexts = RunningContexts::new();
        let n = probe_module_source(
            &contexts,
            &CancellationToken::new(),
            &lister(),
            &Module::new("/data/home", "home"),
        )
        .await
        .unwrap();
        assert_eq!(n, 3);
        assert!(contexts.is_empty());
    }
}
