//! Value types shared by planning and execution: byte counts, partial
//! progress, paired source/destination paths and the per-folder backup type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// A non-negative number of bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolderSize(pub u64);

impl FolderSize {
    pub const ZERO: FolderSize = FolderSize(0);

    pub fn new(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    pub fn saturating_sub(self, other: FolderSize) -> FolderSize {
        FolderSize(self.0.saturating_sub(other.0))
    }

    /// Sum of every category present in `progress`.
    pub fn add_progress(self, progress: &SizeProgress) -> FolderSize {
        self + progress.total()
    }
}

impl Add for FolderSize {
    type Output = FolderSize;

    fn add(self, rhs: FolderSize) -> FolderSize {
        FolderSize(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for FolderSize {
    fn add_assign(&mut self, rhs: FolderSize) {
        *self = *self + rhs;
    }
}

impl Sum for FolderSize {
    fn sum<I: Iterator<Item = FolderSize>>(iter: I) -> Self {
        iter.fold(FolderSize::ZERO, |acc, s| acc + s)
    }
}

impl From<u64> for FolderSize {
    fn from(bytes: u64) -> Self {
        FolderSize(bytes)
    }
}

impl fmt::Display for FolderSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
        if self.0 < 1024 {
            return write!(f, "{} B", self.0);
        }
        let mut value = self.0 as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit < UNITS.len() - 1 {
            value /= 1024.0;
            unit += 1;
        }
        write!(f, "{:.2} {}", value, UNITS[unit])
    }
}

/// Bytes accounted per outcome. `None` means "nothing in this category",
/// which differs from `Some(FolderSize::ZERO)` (an empty block that completed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeProgress {
    pub completed: Option<FolderSize>,
    pub skipped: Option<FolderSize>,
    pub failed: Option<FolderSize>,
}

impl SizeProgress {
    pub fn completed(size: FolderSize) -> Self {
        Self {
            completed: Some(size),
            ..Self::default()
        }
    }

    pub fn skipped(size: FolderSize) -> Self {
        Self {
            skipped: Some(size),
            ..Self::default()
        }
    }

    pub fn failed(size: FolderSize) -> Self {
        Self {
            failed: Some(size),
            ..Self::default()
        }
    }

    /// Field-wise merge. A category present on either side stays present.
    pub fn add(&self, other: &SizeProgress) -> SizeProgress {
        SizeProgress {
            completed: merge(self.completed, other.completed),
            skipped: merge(self.skipped, other.skipped),
            failed: merge(self.failed, other.failed),
        }
    }

    pub fn total(&self) -> FolderSize {
        [self.completed, self.skipped, self.failed]
            .into_iter()
            .flatten()
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_none() && self.skipped.is_none() && self.failed.is_none()
    }

    pub fn has_failures(&self) -> bool {
        self.failed.is_some()
    }
}

fn merge(a: Option<FolderSize>, b: Option<FolderSize>) -> Option<FolderSize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// Source and destination paths that descend in lockstep.
///
/// The source is kept as a string because it may be an rsync remote spec
/// (`host::module/dir`, `user@host:/dir`). The destination is relative to the
/// snapshot folder of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrcDstPath {
    pub src: String,
    pub dst: String,
}

impl SrcDstPath {
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }

    pub fn join(&self, name: &str) -> SrcDstPath {
        SrcDstPath {
            src: join_path(&self.src, name),
            dst: join_path(&self.dst, name),
        }
    }
}

impl fmt::Display for SrcDstPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

fn join_path(base: &str, name: &str) -> String {
    if base.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderBackupType {
    #[default]
    Unknown,
    Skip,
    RecurseFully,
    ContentOnly,
}

impl fmt::Display for FolderBackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FolderBackupType::Unknown => "unknown",
            FolderBackupType::Skip => "skip",
            FolderBackupType::RecurseFully => "recursive",
            FolderBackupType::ContentOnly => "content",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn opt_size() -> impl Strategy<Value = Option<FolderSize>> {
        proptest::option::of((0u64..1u64 << 40).prop_map(FolderSize))
    }

    fn progress() -> impl Strategy<Value = SizeProgress> {
        (opt_size(), opt_size(), opt_size()).prop_map(|(completed, skipped, failed)| SizeProgress {
            completed,
            skipped,
            failed,
        })
    }

    proptest! {
        #[test]
        fn add_preserves_total(a in progress(), b in progress()) {
            prop_assert_eq!(a.add(&b).total(), a.total() + b.total());
        }

        #[test]
        fn add_keeps_absent_fields_absent(a in progress(), b in progress()) {
            let sum = a.add(&b);
            prop_assert_eq!(sum.completed.is_none(), a.completed.is_none() && b.completed.is_none());
            prop_assert_eq!(sum.skipped.is_none(), a.skipped.is_none() && b.skipped.is_none());
            prop_assert_eq!(sum.failed.is_none(), a.failed.is_none() && b.failed.is_none());
        }
    }

    #[test]
    fn test_zero_is_not_absent() {
        let empty_done = SizeProgress::completed(FolderSize::ZERO);
        assert!(!empty_done.is_empty());
        assert_eq!(empty_done.total(), FolderSize::ZERO);
        assert!(SizeProgress::default().is_empty());
    }

    #[test]
    fn test_present_plus_absent_is_present() {
        let a = SizeProgress::failed(FolderSize(10));
        let b = SizeProgress::completed(FolderSize(5));
        let sum = a.add(&b);
        assert_eq!(sum.failed, Some(FolderSize(10)));
        assert_eq!(sum.completed, Some(FolderSize(5)));
        assert_eq!(sum.skipped, None);
        assert!(sum.has_failures());
    }

    #[test]
    fn test_join_extends_both_sides() {
        let root = SrcDstPath::new("backup@nas::home/", "home");
        let child = root.join("docs").join("2024");
        assert_eq!(child.src, "backup@nas::home/docs/2024");
        assert_eq!(child.dst, "home/docs/2024");

        let top = SrcDstPath::new("/srv/data", "");
        assert_eq!(top.join("a").dst, "a");
    }

    #[test]
    fn test_size_display() {
        assert_eq!(FolderSize(512).to_string(), "512 B");
        assert_eq!(FolderSize(1536).to_string(), "1.50 KiB");
        assert_eq!(FolderSize(5 * 1024 * 1024 * 1024).to_string(), "5.00 GiB");
    }

    #[test]
    fn test_add_progress() {
        let base = FolderSize(100);
        let p = SizeProgress {
            completed: Some(FolderSize(1)),
            skipped: None,
            failed: Some(FolderSize(2)),
        };
        assert_eq!(base.add_progress(&p), FolderSize(103));
    }
}
