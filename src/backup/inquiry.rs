//! Directory inquiry: builds the folder tree of a module source from
//! metadata listings only, one listing per folder.

use super::dir::DirTree;
use super::rsync_output::{EntryKind, ListEntry};
use super::types::{FolderSize, SrcDstPath};
use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Metadata access to a source tree.
#[async_trait]
pub trait DirLister: Send + Sync {
    /// Entries directly inside the folder `path`. `auth` is the rsync
    /// daemon password, if the source needs one.
    async fn list(&self, path: &str, auth: Option<&str>, cancel: &CancellationToken) -> Result<Vec<ListEntry>>;

    /// Total bytes of regular files anywhere below `path`.
    async fn measure(&self, path: &str, auth: Option<&str>, cancel: &CancellationToken) -> Result<FolderSize>;
}

/// Lists folders on a locally mounted filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalLister;

#[async_trait]
impl DirLister for LocalLister {
    async fn list(&self, path: &str, _auth: Option<&str>, cancel: &CancellationToken) -> Result<Vec<ListEntry>> {
        if cancel.is_cancelled() {
            return Err(BackupError::ProcessTerminated);
        }

        let meta = fs::metadata(path).await.map_err(|e| inquiry_error(path, e))?;
        if !meta.is_dir() {
            return Err(BackupError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(path).await.map_err(|e| inquiry_error(path, e))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| inquiry_error(path, e))? {
            let file_type = entry.file_type().await.map_err(|e| inquiry_error(path, e))?;
            let kind = if file_type.is_dir() {
                EntryKind::Dir
            } else if file_type.is_file() {
                EntryKind::File
            } else if file_type.is_symlink() {
                EntryKind::Symlink
            } else {
                EntryKind::Other
            };
            let size = if kind == EntryKind::File {
                entry.metadata().await.map(|m| m.len()).unwrap_or(0)
            } else {
                0
            };
            entries.push(ListEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                kind,
                size,
            });
        }
        Ok(entries)
    }

    async fn measure(&self, path: &str, _auth: Option<&str>, cancel: &CancellationToken) -> Result<FolderSize> {
        let root = PathBuf::from(path);
        let token = cancel.clone();
        let total = tokio::task::spawn_blocking(move || walk_size(&root, &token))
            .await
            .map_err(|e| BackupError::Inquiry {
                path: path.to_string(),
                message: e.to_string(),
            })??;
        Ok(FolderSize(total))
    }
}

fn walk_size(root: &Path, cancel: &CancellationToken) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(root).follow_links(false) {
        if cancel.is_cancelled() {
            return Err(BackupError::ProcessTerminated);
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

fn inquiry_error(path: &str, err: std::io::Error) -> BackupError {
    BackupError::Inquiry {
        path: path.to_string(),
        message: err.to_string(),
    }
}

/// Builds the tree below `paths.src`.
///
/// A folder containing `ignore_file` is marked ignored and not descended;
/// its recursive size is measured with one extra metadata call. Subfolders
/// are visited in name order so repeated inquiries give identical trees.
pub async fn inquire_dir_tree(
    lister: &dyn DirLister,
    paths: SrcDstPath,
    ignore_file: &str,
    auth: Option<&str>,
    cancel: &CancellationToken,
) -> Result<DirTree> {
    let mut tree = DirTree::with_root(paths);
    let mut stack = vec![tree.root()];

    while let Some(id) = stack.pop() {
        if cancel.is_cancelled() {
            return Err(BackupError::ProcessTerminated);
        }

        let src = tree.get(id).paths.src.clone();
        let entries = lister.list(&src, auth, cancel).await?;

        if entries
            .iter()
            .any(|e| !e.is_dir() && e.name == ignore_file)
        {
            let ignored = lister.measure(&src, auth, cancel).await?;
            debug!("Ignoring {} ({})", src, ignored);
            tree.mark_ignored(id, ignored);
            continue;
        }

        let content: FolderSize = entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| FolderSize(e.size))
            .sum();
        tree.set_content_size(id, content);

        let mut subdirs: Vec<&str> = entries
            .iter()
            .filter(|e| e.is_dir())
            .map(|e| e.name.as_str())
            .collect();
        subdirs.sort_unstable();

        let children: Vec<_> = subdirs
            .into_iter()
            .map(|name| tree.push_child(id, name))
            .collect();
        stack.extend(children.into_iter().rev());
    }

    tree.count_children();
    Ok(tree)
}
