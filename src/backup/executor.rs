//! Pass 2: runs a [`Plan`] block by block into a new snapshot folder.

use super::notifier::{format_eta, FolderDone, FolderStart, ProgressObserver};
use super::plan::{Block, Node, Plan, Progress};
use super::recovery::{RecoveryDecision, RecoveryHook, SpaceExhaustion};
use super::rsync::{
    build_transfer_args, SyncPrimitive, TransferOutcome, TransferRequest, SPACE_EXIT_CODES,
    TRANSIENT_EXIT_CODES,
};
use super::snapshot::{find_link_targets, find_snapshots, SnapshotFolder};
use super::types::{FolderSize, SizeProgress};
use crate::error::{BackupError, Result};
use crate::utils::disk::SpaceProbe;
use crate::utils::session_log::{LogEntry, SessionLog};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SESSION_LOG_TAIL: usize = 1000;
/// Session log entries handed back with the outcome.
const OUTCOME_LOG_TAIL: usize = 50;

/// Collaborators a session talks to.
pub struct BackupEnv<'a> {
    pub sync: &'a dyn SyncPrimitive,
    pub space: &'a dyn SpaceProbe,
    pub hook: &'a dyn RecoveryHook,
    pub observer: &'a dyn ProgressObserver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Succeeded,
    SucceededWithErrors,
    Terminated,
    Failed,
}

impl SessionStatus {
    pub fn from_result(result: &Result<SessionOutcome>) -> Self {
        match result {
            Ok(outcome) => outcome.status(),
            Err(e) if e.is_terminated() => SessionStatus::Terminated,
            Err(_) => SessionStatus::Failed,
        }
    }
}

/// Result of a session that ran to the end of its plan.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub snapshot: PathBuf,
    pub progress: SizeProgress,
    pub failed_blocks: usize,
    pub skipped_blocks: usize,
    /// Session log file inside the renamed snapshot.
    pub log_file: PathBuf,
    pub log_tail: Vec<LogEntry>,
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        if self.failed_blocks == 0 && self.skipped_blocks == 0 {
            SessionStatus::Succeeded
        } else {
            SessionStatus::SucceededWithErrors
        }
    }
}

struct BlockResult {
    delta: SizeProgress,
    error: Option<String>,
}

/// State shared by every block of one session.
struct Session<'a> {
    plan: &'a Plan,
    env: &'a BackupEnv<'a>,
    dest_root: &'a Path,
    snapshot: &'a Path,
    log: &'a SessionLog,
    cancel: &'a CancellationToken,
    failed_blocks: usize,
    skipped_blocks: usize,
}

impl Plan {
    /// Transfers every block of the plan into a fresh snapshot folder under
    /// `dest_root`, accumulating into `progress`.
    ///
    /// The snapshot is renamed to its final name only when every block was
    /// attempted. Cancellation returns [`BackupError::ProcessTerminated`]
    /// and leaves the `(incomplete)` folder in place.
    pub async fn run_backup(
        &self,
        progress: &mut Progress,
        dest_root: &Path,
        env: &BackupEnv<'_>,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome> {
        if cancel.is_cancelled() {
            return Err(BackupError::ProcessTerminated);
        }

        let previous = if self.config.use_previous_backup {
            find_snapshots(dest_root).await?
        } else {
            Vec::new()
        };

        let mut snapshot = SnapshotFolder::create_incomplete(dest_root, Local::now().naive_local()).await?;
        let log = SessionLog::create(&snapshot.path, SESSION_LOG_TAIL)?;
        log.info(format!(
            "Backup started: {} modules, {} folders, {} to back up, {} ignored",
            self.nodes.len(),
            self.folders_count(),
            self.total_size(),
            self.ignore_size()
        ));

        progress.start();
        let mut session = Session {
            plan: self,
            env,
            dest_root,
            snapshot: &snapshot.path,
            log: &log,
            cancel,
            failed_blocks: 0,
            skipped_blocks: 0,
        };

        let mut result = Ok(());
        for node in &self.nodes {
            result = session.run_node(node, &previous, progress).await;
            if result.is_err() {
                break;
            }
        }
        let (failed_blocks, skipped_blocks) = (session.failed_blocks, session.skipped_blocks);

        if let Err(e) = snapshot.write_signatures(&self.signatures()).await {
            warn!("Failed to write signatures: {}", e);
            log.error(format!("Failed to write signatures: {}", e));
        }

        match result {
            Ok(()) => {
                log.info(format!(
                    "Backup finished: {} completed, {} skipped, {} failed",
                    progress.total_progress.completed.unwrap_or_default(),
                    progress.total_progress.skipped.unwrap_or_default(),
                    progress.total_progress.failed.unwrap_or_default()
                ));
                flush(&log);
                snapshot.finalize().await?;
                let log_name = log.path().file_name().map(PathBuf::from).unwrap_or_default();
                Ok(SessionOutcome {
                    log_file: snapshot.path.join(log_name),
                    snapshot: snapshot.path.clone(),
                    progress: progress.total_progress,
                    failed_blocks,
                    skipped_blocks,
                    log_tail: log.get_logs(Some(OUTCOME_LOG_TAIL)),
                })
            }
            Err(e) => {
                if e.is_terminated() {
                    info!("Backup interrupted");
                    log.info("Backup interrupted");
                } else {
                    error!("Backup failed: {}", e);
                    log.error(format!("Backup failed: {}", e));
                }
                flush(&log);
                Err(e)
            }
        }
    }
}

fn flush(log: &SessionLog) {
    if let Err(e) = log.flush() {
        warn!("Failed to flush session log: {}", e);
    }
}

impl Session<'_> {
    async fn run_node(
        &mut self,
        node: &Node,
        previous: &[SnapshotFolder],
        progress: &mut Progress,
    ) -> Result<()> {
        let config = &self.plan.config;
        let link_roots = if config.use_previous_backup {
            find_link_targets(previous, &node.signature, config.previous_backup_depth).await?
        } else {
            Vec::new()
        };
        if link_roots.is_empty() {
            debug!("No previous snapshot for {}", node.module.source_rsync);
        }

        self.log.info(format!(
            "Module #{} {}: {} blocks, {} to back up",
            node.index + 1,
            node.module.source_rsync,
            node.blocks().len(),
            node.total_size
        ));

        let plan_total = self.plan.total_size();
        let mut processed = FolderSize::ZERO;
        for block in node.blocks() {
            if self.cancel.is_cancelled() {
                return Err(BackupError::ProcessTerminated);
            }

            progress.tick(plan_total);
            let start = FolderStart {
                dest_root: self.dest_root,
                paths: &block.paths,
                backup_type: block.backup_type,
                bytes_left: progress.bytes_left(plan_total),
                elapsed: progress.elapsed,
                eta: progress.eta,
            };
            self.log.info(format!(
                "Start {} [{}], {} left, ETA {}",
                start.paths,
                start.backup_type,
                start.bytes_left,
                format_eta(start.eta)
            ));
            self.env.observer.folder_start_backup(&start);

            let request = self.request_for(node, &block, &link_roots);
            let result = self.run_block(&block, &request).await?;
            progress.add(&result.delta, plan_total);
            processed = processed.add_progress(&result.delta);

            let done = FolderDone {
                dest_root: self.dest_root,
                paths: &block.paths,
                backup_type: block.backup_type,
                bytes_left: progress.bytes_left(plan_total),
                size_delta: result.delta,
                elapsed: progress.elapsed,
                eta: progress.eta,
                error: result.error.as_deref(),
            };
            let (level, verb) = match done.error {
                Some(_) => ("error", "Failed"),
                None => ("info", "Done"),
            };
            self.log.add_log(
                level,
                format!(
                    "{} {} [{}] ({}), {} left, ETA {}",
                    verb,
                    done.paths,
                    done.backup_type,
                    done.size_delta.total(),
                    done.bytes_left,
                    format_eta(done.eta)
                ),
                None,
            );
            self.env.observer.folder_done_backup(&done);
        }

        self.log.info(format!(
            "Module #{} {} finished: {} of {} processed",
            node.index + 1,
            node.module.source_rsync,
            processed,
            node.total_size
        ));
        Ok(())
    }

    fn request_for(&self, node: &Node, block: &Block, link_roots: &[PathBuf]) -> TransferRequest {
        let config = &self.plan.config;
        TransferRequest {
            src: block.paths.src.clone(),
            dst: self.snapshot.join(&block.paths.dst),
            recursive: block.recursive,
            excludes: block.excludes.clone(),
            link_dests: link_roots.iter().map(|r| r.join(&block.paths.dst)).collect(),
            options: config.transfer_options_for(&node.module),
            chmod: node.module.change_file_permission.clone(),
            password: node.module.auth_password.clone(),
            verbose: config.enable_intensive_low_level_log_for_rsync,
        }
    }

    async fn run_block(&mut self, block: &Block, request: &TransferRequest) -> Result<BlockResult> {
        let predicted = block.predicted_size;
        let mut retries_left = self.plan.config.retry_count;
        let mut repeat_count = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(BackupError::ProcessTerminated);
            }

            let outcome = self.env.sync.transfer(request, self.cancel).await?;
            self.log_transfer(block, request, &outcome);

            if outcome.success() {
                return Ok(BlockResult {
                    delta: SizeProgress::completed(predicted),
                    error: None,
                });
            }

            let message = outcome.error_message();
            let code = outcome.exit_code.unwrap_or(-1);

            if SPACE_EXIT_CODES.contains(&code) {
                let free = self.free_space();
                let ctx = SpaceExhaustion {
                    message: message.clone(),
                    exit_code: code,
                    paths: block.paths.clone(),
                    predicted_size: predicted,
                    free_space: free,
                    repeat_count,
                    retries_left,
                };
                match self.env.hook.resolve_space_exhaustion(&ctx).await {
                    RecoveryDecision::Retry if retries_left > 0 => {
                        retries_left -= 1;
                        repeat_count += 1;
                        self.log.info(format!("Retrying {} after exit code {}", block.paths.src, code));
                        continue;
                    }
                    RecoveryDecision::Retry | RecoveryDecision::Ignore => {
                        self.skipped_blocks += 1;
                        self.log.add_log(
                            "error",
                            format!("Skipped after exit code {}: {}", code, message),
                            Some(block.paths.src.clone()),
                        );
                        return Ok(BlockResult {
                            delta: SizeProgress::skipped(predicted),
                            error: Some(message),
                        });
                    }
                    RecoveryDecision::Abort => {
                        return Err(BackupError::SpaceExhausted {
                            required: predicted.bytes(),
                            available: free.unwrap_or_default().bytes(),
                        });
                    }
                }
            } else if TRANSIENT_EXIT_CODES.contains(&code) && retries_left > 0 {
                retries_left -= 1;
                repeat_count += 1;
                warn!(
                    "rsync exit code {} on {}, retry {} ({} left)",
                    code, block.paths.src, repeat_count, retries_left
                );
                continue;
            }

            self.failed_blocks += 1;
            self.log
                .add_log("error", message.clone(), Some(block.paths.src.clone()));
            return Ok(BlockResult {
                delta: SizeProgress::failed(predicted),
                error: Some(message),
            });
        }
    }

    fn free_space(&self) -> Option<FolderSize> {
        match self.env.space.free_space(self.snapshot) {
            Ok(bytes) => Some(FolderSize(bytes)),
            Err(e) => {
                warn!("Cannot measure free space at {}: {}", self.snapshot.display(), e);
                None
            }
        }
    }

    fn log_transfer(&self, block: &Block, request: &TransferRequest, outcome: &TransferOutcome) {
        let config = &self.plan.config;
        if config.enable_low_level_log_for_rsync || config.enable_intensive_low_level_log_for_rsync {
            let args: Vec<String> = build_transfer_args(request)
                .iter()
                .map(|a| a.to_string_lossy().to_string())
                .collect();
            self.log.add_log(
                "debug",
                format!("rsync {} -> exit {:?}", args.join(" "), outcome.exit_code),
                Some(block.paths.src.clone()),
            );
        }
        if config.enable_intensive_low_level_log_for_rsync {
            for line in &outcome.output {
                self.log.add_log("debug", line.clone(), None);
            }
        }
        let stats = &outcome.stats;
        if let (Some(files), Some(bytes)) = (stats.files_transferred, stats.transferred_size) {
            let mut line = format!("{} files transferred, {}", files, FolderSize(bytes));
            if let (Some(total_files), Some(total_bytes)) = (stats.file_count, stats.total_file_size) {
                line.push_str(&format!(" of {} files, {}", total_files, FolderSize(total_bytes)));
            }
            self.log.add_log("info", line, Some(block.paths.dst.clone()));
        }
    }
}
