//! Planning and execution core of a deduplicating rsync backup.
//!
//! Pass 1 ([`backup::build_backup_plan`]) inquires every configured source
//! and partitions it into transfer blocks. Pass 2 ([`backup::Plan::run_backup`])
//! drives rsync block by block into a dated snapshot folder, hardlinking
//! unchanged files against earlier snapshots.

pub mod backup;
pub mod error;
pub mod utils;

pub use error::{BackupError, Result};
