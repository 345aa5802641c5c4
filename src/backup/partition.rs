//! Block partitioning of an inquired tree.
//!
//! Every folder gets a [`FolderBackupType`]:
//! - ignored folders are `Skip`;
//! - the smallest subtree whose full size reaches `min` is cut as one
//!   `RecurseFully` block;
//! - a folder above a block gathers its own files and every subfolder that
//!   did not reach `min` on its own. When that reaches `min` the folder is a
//!   `RecurseFully` block with the blocks below it cut out, otherwise it is
//!   `ContentOnly` and still carries what it gathered;
//! - a tree that never reaches `min` is one `RecurseFully` block at the root.
//!
//! Gathered subfolders keep `Unknown` and stay unmeasured. `max` is a target:
//! a folder is never split just because it is over it.

use super::dir::{DirId, DirTree};
use super::types::{FolderBackupType, FolderSize};
use crate::utils::config::Config;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct BlockPartitioner {
    min: FolderSize,
    max: FolderSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ignored,
    /// Subtree holds no block yet.
    Pending,
    /// Subtree holds at least one block.
    Resolved,
}

impl BlockPartitioner {
    pub fn new(min: u64, max: u64) -> Self {
        Self {
            min: FolderSize(min),
            max: FolderSize(max.max(min)),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.min_block_size, config.max_block_size)
    }

    pub fn partition(&self, tree: &mut DirTree) {
        measure_sizes(tree);

        let mut state = vec![State::Pending; tree.len()];
        for id in tree.ids().rev() {
            if tree.get(id).metrics().ignore_to_backup {
                assign(tree, id, FolderBackupType::Skip);
                state[id.index()] = State::Ignored;
                continue;
            }

            let dir = tree.get(id);
            let any_resolved = dir.childs.iter().any(|c| state[c.index()] == State::Resolved);
            let next = if any_resolved {
                let pending: FolderSize = dir
                    .childs
                    .iter()
                    .filter(|c| state[c.index()] == State::Pending)
                    .map(|c| tree.get(*c).metrics().full_size.unwrap_or_default())
                    .sum();
                let gathered = dir.metrics().size.unwrap_or_default() + pending;
                if gathered >= self.min {
                    self.cut(tree, id, gathered);
                } else {
                    assign(tree, id, FolderBackupType::ContentOnly);
                }
                State::Resolved
            } else {
                let full = dir.metrics().full_size.unwrap_or_default();
                if full >= self.min {
                    self.cut(tree, id, full);
                    State::Resolved
                } else {
                    State::Pending
                }
            };
            state[id.index()] = next;
        }

        let root = tree.root();
        if state[root.index()] == State::Pending {
            assign(tree, root, FolderBackupType::RecurseFully);
        }

        debug!(
            "Partitioned {} into {} blocks",
            tree.root_dir().paths.src,
            block_count(tree)
        );
    }

    fn cut(&self, tree: &mut DirTree, id: DirId, size: FolderSize) {
        if size > self.max {
            debug!("Block {} is {}, over the {} target", tree.get(id).paths.src, size, self.max);
        }
        assign(tree, id, FolderBackupType::RecurseFully);
    }
}

fn assign(tree: &mut DirTree, id: DirId, backup_type: FolderBackupType) {
    let metrics = tree.metrics_mut(id);
    metrics.backup_type = backup_type;
    metrics.measured = true;
}

/// Fills `size` and `full_size` bottom-up. Ignored folders count zero.
fn measure_sizes(tree: &mut DirTree) {
    for id in tree.ids().rev() {
        let dir = tree.get(id);
        let (size, full) = if dir.metrics().ignore_to_backup {
            (FolderSize::ZERO, FolderSize::ZERO)
        } else {
            let below: FolderSize = tree
                .children(id)
                .map(|c| c.metrics().full_size.unwrap_or_default())
                .sum();
            (dir.content_size, dir.content_size + below)
        };
        let metrics = tree.metrics_mut(id);
        metrics.size = Some(size);
        metrics.full_size = Some(full);
    }
}

fn block_count(tree: &DirTree) -> usize {
    tree.ids()
        .filter(|id| {
            matches!(
                tree.get(*id).backup_type(),
                FolderBackupType::RecurseFully | FolderBackupType::ContentOnly
            )
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::types::SrcDstPath;
    use crate::utils::config::{GB, MB};
    use proptest::prelude::*;

    fn tree_with(sizes: &[(usize, u64)], root_size: u64) -> DirTree {
        let mut tree = DirTree::with_root(SrcDstPath::new("/src", ""));
        tree.set_content_size(tree.root(), FolderSize(root_size));
        for (i, (parent, size)) in sizes.iter().enumerate() {
            let id = tree.push_child(DirId(*parent), &format!("d{}", i + 1));
            tree.set_content_size(id, FolderSize(*size));
        }
        tree.count_children();
        tree
    }

    fn kind(tree: &DirTree, idx: usize) -> FolderBackupType {
        tree.get(DirId(idx)).backup_type()
    }

    #[test]
    fn test_flat_folder_is_one_block() {
        let mut tree = tree_with(&[], 2 * GB);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);
        assert_eq!(kind(&tree, 0), FolderBackupType::RecurseFully);
        assert_eq!(block_count(&tree), 1);
        assert_eq!(tree.total_size(), FolderSize(2 * GB));
    }

    #[test]
    fn test_small_tree_is_one_block_at_root() {
        let mut tree = tree_with(&[(0, 10 * MB), (1, 20 * MB), (0, 5 * MB)], MB);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);
        assert_eq!(kind(&tree, 0), FolderBackupType::RecurseFully);
        for idx in 1..4 {
            assert_eq!(kind(&tree, idx), FolderBackupType::Unknown);
            assert!(!tree.get(DirId(idx)).metrics().measured);
        }
        assert_eq!(tree.total_size(), FolderSize(36 * MB));
    }

    #[test]
    fn test_ancestors_become_content_only() {
        // root
        //   d1 400MB
        //   d2 100MB
        //   d3 50MB
        //     d4 350MB
        let mut tree = tree_with(&[(0, 400 * MB), (0, 100 * MB), (0, 50 * MB), (3, 350 * MB)], MB);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);

        assert_eq!(kind(&tree, 0), FolderBackupType::ContentOnly);
        assert_eq!(kind(&tree, 1), FolderBackupType::RecurseFully);
        // gathered by the root, too small on its own
        assert_eq!(kind(&tree, 2), FolderBackupType::Unknown);
        assert_eq!(kind(&tree, 3), FolderBackupType::ContentOnly);
        assert_eq!(kind(&tree, 4), FolderBackupType::RecurseFully);

        let spans = tree.spans();
        assert_eq!(spans.len(), 4);
        assert!(spans[0].recursive);
        assert_eq!(spans[0].excludes, vec!["d1", "d3"]);
        assert_eq!(spans[0].size, FolderSize(101 * MB));
        // d3 has nothing to gather, so only its own files go
        assert!(!spans[2].recursive);
        assert_eq!(spans[2].size, FolderSize(50 * MB));
        assert_eq!(tree.total_size(), FolderSize(901 * MB));
        assert_eq!(tree.total_size(), tree.full_backup_size());
    }

    #[test]
    fn test_small_siblings_are_gathered_with_parent() {
        // d1 400MB next to ten 50MB folders
        let mut sizes = vec![(0usize, 400 * MB)];
        sizes.extend((0..10).map(|_| (0usize, 50 * MB)));
        let mut tree = tree_with(&sizes, 0);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);

        assert_eq!(kind(&tree, 0), FolderBackupType::RecurseFully);
        assert_eq!(kind(&tree, 1), FolderBackupType::RecurseFully);
        for idx in 2..12 {
            assert_eq!(kind(&tree, idx), FolderBackupType::Unknown);
        }

        let spans = tree.spans();
        let laid_out: Vec<_> = spans
            .iter()
            .map(|s| (tree.relative_path(s.id), s.size, s.excludes.clone()))
            .collect();
        assert_eq!(
            laid_out,
            vec![
                (String::new(), FolderSize(500 * MB), vec!["d1".to_string()]),
                ("d1".to_string(), FolderSize(400 * MB), vec![]),
            ]
        );
        assert!(spans.iter().all(|s| s.size >= FolderSize(300 * MB)));
        assert_eq!(tree.total_size(), FolderSize(900 * MB));
    }

    #[test]
    fn test_oversized_leaf_stays_whole() {
        let mut tree = tree_with(&[(0, 9 * GB), (0, 400 * MB)], 0);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);
        assert_eq!(kind(&tree, 1), FolderBackupType::RecurseFully);
        assert_eq!(tree.get(DirId(1)).metrics().full_size, Some(FolderSize(9 * GB)));
        assert_eq!(kind(&tree, 0), FolderBackupType::ContentOnly);
    }

    #[test]
    fn test_over_max_folder_is_not_split() {
        // 30 folders of 200MB each: none reaches min alone, together 6GB > max
        let sizes: Vec<_> = (0..30).map(|_| (0usize, 200 * MB)).collect();
        let mut tree = tree_with(&sizes, 0);
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);
        assert_eq!(kind(&tree, 0), FolderBackupType::RecurseFully);
        assert_eq!(block_count(&tree), 1);
        assert_eq!(tree.total_size(), FolderSize(6 * GB));
    }

    #[test]
    fn test_ignored_folder_is_skip_and_weightless() {
        let mut tree = tree_with(&[(0, 400 * MB), (0, 0)], 0);
        tree.mark_ignored(DirId(2), FolderSize(7 * GB));
        tree.count_children();
        BlockPartitioner::new(300 * MB, 5 * GB).partition(&mut tree);

        assert_eq!(kind(&tree, 2), FolderBackupType::Skip);
        assert_eq!(tree.total_size(), FolderSize(400 * MB));
        assert_eq!(tree.full_backup_size(), FolderSize(400 * MB));
        assert_eq!(tree.ignore_size(), FolderSize(7 * GB));
    }

    #[test]
    fn test_ignored_root() {
        let mut tree = tree_with(&[], 0);
        tree.mark_ignored(tree.root(), FolderSize(5));
        BlockPartitioner::new(1, 2).partition(&mut tree);
        assert_eq!(kind(&tree, 0), FolderBackupType::Skip);
        assert_eq!(block_count(&tree), 0);
        assert_eq!(tree.total_size(), FolderSize::ZERO);
    }

    fn random_tree() -> impl Strategy<Value = (DirTree, u64, u64)> {
        (
            prop::collection::vec((any::<usize>(), 0u64..2_000, any::<bool>()), 0..40),
            0u64..2_000,
            1u64..3_000,
            0u64..3_000,
        )
            .prop_map(|(spec, root_size, min, extra)| {
                let mut tree = DirTree::with_root(SrcDstPath::new("/r", ""));
                tree.set_content_size(tree.root(), FolderSize(root_size));
                for (i, (parent, size, _)) in spec.iter().enumerate() {
                    let parent = DirId(parent % (i + 1));
                    let id = tree.push_child(parent, &format!("n{}", i));
                    tree.set_content_size(id, FolderSize(*size));
                }
                for (i, (_, size, ignored)) in spec.iter().enumerate() {
                    let id = DirId(i + 1);
                    if *ignored && tree.get(id).childs.is_empty() {
                        tree.mark_ignored(id, FolderSize(*size));
                    }
                }
                tree.count_children();
                (tree, min, min + extra)
            })
    }

    proptest! {
        #[test]
        fn partition_invariants((mut tree, min, max) in random_tree()) {
            BlockPartitioner::new(min, max).partition(&mut tree);

            prop_assert_eq!(tree.total_size(), tree.full_backup_size());
            prop_assert_eq!(tree.folders_count(), tree.len() - 1);

            let spans = tree.spans();
            prop_assert_eq!(spans.len(), block_count(&tree));
            for span in &spans {
                if span.backup_type == FolderBackupType::RecurseFully && span.id != tree.root() {
                    prop_assert!(span.size >= FolderSize(min), "{:?} below {}", span, min);
                }
            }

            for id in tree.ids() {
                let dir = tree.get(id);
                let m = dir.metrics();
                if m.ignore_to_backup {
                    prop_assert_eq!(m.backup_type, FolderBackupType::Skip);
                    continue;
                }
                match m.backup_type {
                    // gathered into the span of the nearest assigned ancestor
                    FolderBackupType::Unknown => {
                        let parent = dir.parent.unwrap();
                        prop_assert_ne!(tree.get(parent).backup_type(), FolderBackupType::Skip);
                    }
                    FolderBackupType::RecurseFully | FolderBackupType::ContentOnly => {
                        prop_assert!(m.measured);
                    }
                    FolderBackupType::Skip => prop_assert!(false, "skip without sentinel"),
                }
            }
        }
    }
}
