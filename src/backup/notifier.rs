//! Observer contracts for plan building and backup progress.
//!
//! All callbacks are made from the single worker running the session, in
//! order. Handlers must return promptly.

use super::dir::DirTree;
use super::types::{FolderBackupType, FolderSize, SizeProgress, SrcDstPath};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub trait PlanObserver: Send + Sync {
    fn node_structure_start_inquiry(&self, _index: usize, _source: &str) {}

    fn node_structure_done_inquiry(&self, _index: usize, _source: &str, _tree: &DirTree) {}
}

#[derive(Debug, Clone)]
pub struct FolderStart<'a> {
    pub dest_root: &'a Path,
    pub paths: &'a SrcDstPath,
    pub backup_type: FolderBackupType,
    pub bytes_left: FolderSize,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct FolderDone<'a> {
    pub dest_root: &'a Path,
    pub paths: &'a SrcDstPath,
    pub backup_type: FolderBackupType,
    pub bytes_left: FolderSize,
    pub size_delta: SizeProgress,
    pub elapsed: Duration,
    pub eta: Option<Duration>,
    pub error: Option<&'a str>,
}

pub trait ProgressObserver: Send + Sync {
    fn folder_start_backup(&self, _event: &FolderStart<'_>) {}

    fn folder_done_backup(&self, _event: &FolderDone<'_>) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl PlanObserver for NoopObserver {}
impl ProgressObserver for NoopObserver {}

/// Reports plan and progress events as tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PlanObserver for TracingObserver {
    fn node_structure_start_inquiry(&self, index: usize, source: &str) {
        info!("Inquiring module #{}: {}", index + 1, source);
    }

    fn node_structure_done_inquiry(&self, index: usize, source: &str, tree: &DirTree) {
        info!(
            "Module #{} ({}): {} folders, {} to back up, {} ignored",
            index + 1,
            source,
            tree.folders_count(),
            tree.total_size(),
            tree.ignore_size()
        );
    }
}

impl ProgressObserver for TracingObserver {
    fn folder_start_backup(&self, event: &FolderStart<'_>) {
        debug!(
            "Backing up {} [{}], {} left, ETA {}",
            event.paths,
            event.backup_type,
            event.bytes_left,
            format_eta(event.eta)
        );
    }

    fn folder_done_backup(&self, event: &FolderDone<'_>) {
        match event.error {
            Some(err) => warn!("Block {} failed: {}", event.paths.src, err),
            None => info!(
                "Done {} ({}), {} left, ETA {}",
                event.paths.dst,
                event.size_delta.total(),
                event.bytes_left,
                format_eta(event.eta)
            ),
        }
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(d) => humantime::format_duration(Duration::from_secs(d.as_secs())).to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(None), "unknown");
        assert_eq!(format_eta(Some(Duration::from_millis(90_500))), "1m 30s");
    }
}
