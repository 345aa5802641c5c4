//! Folder tree produced by directory inquiry.
//!
//! Nodes live in an arena owned by [`DirTree`] and refer to each other by
//! [`DirId`]. A node owns its children through the arena; the `parent` index
//! is only used to walk upwards and never decides lifetime. Every child is
//! pushed after its parent, so a child's id is always greater than its
//! parent's id and iterating ids in reverse visits children first.

use super::types::{FolderBackupType, FolderSize, SrcDstPath};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DirId(pub(crate) usize);

impl DirId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirMetrics {
    /// Root is 0.
    pub depth: usize,
    /// Number of folders in this subtree, the folder itself included.
    pub children_count: usize,
    /// Bytes of files directly inside the folder.
    pub size: Option<FolderSize>,
    /// `size` plus the full size of every non-ignored subfolder.
    pub full_size: Option<FolderSize>,
    /// Recursive size of an ignored folder, measured without descending into the tree.
    pub ignored_size: Option<FolderSize>,
    pub ignore_to_backup: bool,
    /// Set once the partitioner has assigned a backup type.
    pub measured: bool,
    pub backup_type: FolderBackupType,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dir {
    pub name: String,
    pub paths: SrcDstPath,
    pub parent: Option<DirId>,
    pub childs: Vec<DirId>,
    pub(crate) content_size: FolderSize,
    metrics: DirMetrics,
}

impl Dir {
    pub fn metrics(&self) -> &DirMetrics {
        &self.metrics
    }

    pub fn backup_type(&self) -> FolderBackupType {
        self.metrics.backup_type
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirTree {
    nodes: Vec<Dir>,
}

impl DirTree {
    pub(crate) fn with_root(paths: SrcDstPath) -> Self {
        let name = last_component(&paths.src);
        Self {
            nodes: vec![Dir {
                name,
                paths,
                parent: None,
                childs: Vec::new(),
                content_size: FolderSize::ZERO,
                metrics: DirMetrics {
                    children_count: 1,
                    ..DirMetrics::default()
                },
            }],
        }
    }

    pub(crate) fn push_child(&mut self, parent: DirId, name: &str) -> DirId {
        let id = DirId(self.nodes.len());
        let (paths, depth) = {
            let p = &self.nodes[parent.0];
            (p.paths.join(name), p.metrics.depth + 1)
        };
        self.nodes.push(Dir {
            name: name.to_string(),
            paths,
            parent: Some(parent),
            childs: Vec::new(),
            content_size: FolderSize::ZERO,
            metrics: DirMetrics {
                depth,
                children_count: 1,
                ..DirMetrics::default()
            },
        });
        self.nodes[parent.0].childs.push(id);
        id
    }

    pub(crate) fn set_content_size(&mut self, id: DirId, size: FolderSize) {
        self.nodes[id.0].content_size = size;
    }

    pub(crate) fn mark_ignored(&mut self, id: DirId, ignored_size: FolderSize) {
        let m = &mut self.nodes[id.0].metrics;
        m.ignore_to_backup = true;
        m.ignored_size = Some(ignored_size);
        m.children_count = 1;
    }

    /// Recomputes `children_count` bottom-up.
    pub(crate) fn count_children(&mut self) {
        for idx in (0..self.nodes.len()).rev() {
            if self.nodes[idx].metrics.ignore_to_backup {
                continue;
            }
            let below: usize = self.nodes[idx]
                .childs
                .iter()
                .map(|c| self.nodes[c.0].metrics.children_count)
                .sum();
            self.nodes[idx].metrics.children_count = 1 + below;
        }
    }

    pub(crate) fn metrics_mut(&mut self, id: DirId) -> &mut DirMetrics {
        &mut self.nodes[id.0].metrics
    }

    pub fn root(&self) -> DirId {
        DirId(0)
    }

    pub fn root_dir(&self) -> &Dir {
        &self.nodes[0]
    }

    pub fn get(&self, id: DirId) -> &Dir {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node ids in creation order (parents before children).
    pub fn ids(&self) -> impl DoubleEndedIterator<Item = DirId> {
        (0..self.nodes.len()).map(DirId)
    }

    pub fn children(&self, id: DirId) -> impl Iterator<Item = &Dir> {
        self.nodes[id.0].childs.iter().map(move |c| &self.nodes[c.0])
    }

    /// Depth-first pre-order below (and including) `start`, children in declaration order.
    #[cfg(test)]
    pub(crate) fn preorder(&self, start: DirId) -> Vec<DirId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id.0].childs.iter().rev().copied());
        }
        out
    }

    /// Folder count without the root.
    pub fn folders_count(&self) -> usize {
        self.nodes[0].metrics.children_count.saturating_sub(1)
    }

    /// Bytes the assigned backup types will transfer, summed over [`spans`](Self::spans).
    pub fn total_size(&self) -> FolderSize {
        self.spans().iter().map(|s| s.size).sum()
    }

    /// Measured bytes of every ignored folder in the tree.
    pub fn ignore_size(&self) -> FolderSize {
        self.nodes
            .iter()
            .filter(|d| d.metrics.ignore_to_backup)
            .map(|d| d.metrics.ignored_size.unwrap_or_default())
            .sum()
    }

    /// Bytes of the non-ignored part of the tree.
    pub fn full_backup_size(&self) -> FolderSize {
        self.nodes[0].metrics.full_size.unwrap_or_default()
    }

    /// Path of `id` relative to the root, `/`-separated. Empty for the root.
    pub fn relative_path(&self, id: DirId) -> String {
        let mut parts = Vec::new();
        let mut cur = id;
        while let Some(parent) = self.nodes[cur.0].parent {
            parts.push(self.nodes[cur.0].name.as_str());
            cur = parent;
        }
        parts.reverse();
        parts.join("/")
    }

    /// Path of `id` relative to `base`, which must be an ancestor or `id` itself.
    fn relative_to(&self, base: DirId, id: DirId) -> String {
        let base_path = self.relative_path(base);
        let path = self.relative_path(id);
        if base_path.is_empty() {
            path
        } else {
            path.get(base_path.len() + 1..).unwrap_or_default().to_string()
        }
    }

    /// Transfer spans in pre-order, one per `RecurseFully` or `ContentOnly` folder.
    ///
    /// A span starts at its folder and takes every `Unknown` folder below
    /// it. Skipped folders and folders that start their own span are cut
    /// with an anchored exclude and their bytes are left out of `size`.
    pub fn spans(&self) -> Vec<BlockSpan> {
        let mut spans = Vec::new();
        let mut pending = vec![self.root()];

        while let Some(id) = pending.pop() {
            let backup_type = self.nodes[id.0].metrics.backup_type;
            if !matches!(
                backup_type,
                FolderBackupType::RecurseFully | FolderBackupType::ContentOnly
            ) {
                continue;
            }

            let mut excludes = Vec::new();
            let mut cuts = Vec::new();
            let mut cut_size = FolderSize::ZERO;
            let mut absorbed = false;
            let mut walk: Vec<DirId> = self.nodes[id.0].childs.iter().rev().copied().collect();
            while let Some(child) = walk.pop() {
                let dir = &self.nodes[child.0];
                match dir.metrics.backup_type {
                    FolderBackupType::Unknown => {
                        absorbed = true;
                        walk.extend(dir.childs.iter().rev().copied());
                    }
                    FolderBackupType::Skip => excludes.push(self.relative_to(id, child)),
                    FolderBackupType::RecurseFully | FolderBackupType::ContentOnly => {
                        excludes.push(self.relative_to(id, child));
                        cut_size += dir.metrics.full_size.unwrap_or_default();
                        cuts.push(child);
                    }
                }
            }

            let recursive = backup_type == FolderBackupType::RecurseFully || absorbed;
            if !recursive {
                excludes.clear();
            }
            let full = self.nodes[id.0].metrics.full_size.unwrap_or_default();
            spans.push(BlockSpan {
                id,
                backup_type,
                recursive,
                size: full.saturating_sub(cut_size),
                excludes,
            });
            pending.extend(cuts.into_iter().rev());
        }
        spans
    }
}

/// What one transfer covers, as laid out by [`DirTree::spans`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockSpan {
    pub id: DirId,
    pub backup_type: FolderBackupType,
    /// Descend into subfolders; false means the folder's own files only.
    pub recursive: bool,
    pub size: FolderSize,
    /// Anchored paths relative to `id`.
    pub excludes: Vec<String>,
}

fn last_component(path: &str) -> String {
    let trimmed = path.trim_end_matches(|c| c == '/' || c == ':');
    trimmed
        .rsplit(|c| c == '/' || c == ':')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(trimmed)
        .to_string()
}
