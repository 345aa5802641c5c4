//! Backup planning (pass 1) and execution (pass 2).

pub mod context;
pub mod dir;
pub mod executor;
pub mod inquiry;
pub mod notifier;
pub mod partition;
pub mod plan;
pub mod recovery;
pub mod rsync;
pub mod rsync_output;
pub mod snapshot;
pub mod types;

pub use context::{BackupSessionStatus, ContextGuard, ContextPack, RunningContexts};
pub use dir::{BlockSpan, Dir, DirId, DirMetrics, DirTree};
pub use executor::{BackupEnv, SessionOutcome, SessionStatus};
pub use inquiry::{inquire_dir_tree, DirLister, LocalLister};
pub use notifier::{FolderDone, FolderStart, NoopObserver, PlanObserver, ProgressObserver, TracingObserver};
pub use partition::BlockPartitioner;
pub use plan::{build_backup_plan, probe_module_source, Block, Node, Plan, Progress};
pub use recovery::{AbortOnSpaceExhaustion, IgnoreSpaceExhaustion, RecoveryDecision, RecoveryHook, SpaceExhaustion};
pub use rsync::{check_rsync, RsyncLister, RsyncTransfer, SyncPrimitive, TransferOutcome, TransferRequest};
pub use types::{FolderBackupType, FolderSize, SizeProgress, SrcDstPath};
