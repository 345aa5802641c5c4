//! Snapshot folders under the destination root and their signatures manifest.
//!
//! A session writes into `~rsync_backup_(incomplete)_<YYYYMMDD-HHMMSS>~` and
//! renames it to `~rsync_backup_<YYYYMMDD-HHMMSS>~` once it completes.

use crate::error::{BackupError, Result};
use crate::utils::config::Module;
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub const SIGNATURES_FILE: &str = "~backup_nodes~.signatures";

const PREFIX: &str = "~rsync_backup_";
const INCOMPLETE: &str = "(incomplete)_";
const SUFFIX: &str = "~";
const TS_FORMAT: &str = "%Y%m%d-%H%M%S";

// rsync refuses more than 20 --link-dest options
pub const MAX_LINK_TARGETS: usize = 20;

pub fn snapshot_name(timestamp: NaiveDateTime, incomplete: bool) -> String {
    format!(
        "{}{}{}{}",
        PREFIX,
        if incomplete { INCOMPLETE } else { "" },
        timestamp.format(TS_FORMAT),
        SUFFIX
    )
}

/// Returns the timestamp and the incomplete flag of a snapshot folder name.
pub fn parse_snapshot_name(name: &str) -> Option<(NaiveDateTime, bool)> {
    let inner = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    let (ts, incomplete) = match inner.strip_prefix(INCOMPLETE) {
        Some(rest) => (rest, true),
        None => (inner, false),
    };
    NaiveDateTime::parse_from_str(ts, TS_FORMAT)
        .ok()
        .map(|t| (t, incomplete))
}

/// blake3 of the module's source identity, hex encoded.
pub fn module_signature(module: &Module) -> String {
    blake3::hash(module.source_identity().as_bytes())
        .to_hex()
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFolder {
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    pub incomplete: bool,
}

impl SnapshotFolder {
    /// Creates a new in-flight snapshot folder below `dest_root`.
    pub async fn create_incomplete(dest_root: &Path, timestamp: NaiveDateTime) -> Result<Self> {
        fs::create_dir_all(dest_root).await?;
        let path = dest_root.join(snapshot_name(timestamp, true));
        fs::create_dir(&path).await.map_err(|e| {
            BackupError::Snapshot(format!("cannot create {}: {}", path.display(), e))
        })?;
        info!("Created snapshot folder {}", path.display());
        Ok(Self {
            path,
            timestamp,
            incomplete: true,
        })
    }

    /// Drops the incomplete marker with a single rename.
    pub async fn finalize(&mut self) -> Result<()> {
        if !self.incomplete {
            return Ok(());
        }
        let parent = self
            .path
            .parent()
            .ok_or_else(|| BackupError::Snapshot(format!("{} has no parent", self.path.display())))?;
        let target = parent.join(snapshot_name(self.timestamp, false));
        if fs::try_exists(&target).await? {
            return Err(BackupError::Snapshot(format!(
                "{} already exists",
                target.display()
            )));
        }
        fs::rename(&self.path, &target).await?;
        info!("Snapshot completed: {}", target.display());
        self.path = target;
        self.incomplete = false;
        Ok(())
    }

    pub async fn write_signatures(&self, signatures: &[String]) -> Result<()> {
        let mut text = signatures.join("\n");
        text.push('\n');
        fs::write(self.path.join(SIGNATURES_FILE), text).await?;
        Ok(())
    }

    /// Signatures recorded by the session that produced this snapshot.
    /// A snapshot without a manifest has none.
    pub async fn read_signatures(&self) -> Result<Vec<String>> {
        match fs::read_to_string(self.path.join(SIGNATURES_FILE)).await {
            Ok(text) => Ok(text
                .lines()
                .filter_map(|l| l.split_whitespace().next())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Snapshot folders directly below `dest_root`, newest first.
pub async fn find_snapshots(dest_root: &Path) -> Result<Vec<SnapshotFolder>> {
    let mut found = Vec::new();
    let mut entries = match fs::read_dir(dest_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        if let Some((timestamp, incomplete)) = parse_snapshot_name(&name.to_string_lossy()) {
            found.push(SnapshotFolder {
                path: entry.path(),
                timestamp,
                incomplete,
            });
        }
    }
    found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    Ok(found)
}

/// Up to `depth` previous snapshots whose manifest lists `signature`, newest first.
pub async fn find_link_targets(
    snapshots: &[SnapshotFolder],
    signature: &str,
    depth: usize,
) -> Result<Vec<PathBuf>> {
    let mut targets = Vec::new();
    let limit = depth.min(MAX_LINK_TARGETS);
    for snapshot in snapshots {
        if targets.len() >= limit {
            break;
        }
        if snapshot.read_signatures().await?.iter().any(|s| s == signature) {
            debug!("Link target for {}: {}", signature, snapshot.path.display());
            targets.push(snapshot.path.clone());
        }
    }
    Ok(targets)
}
