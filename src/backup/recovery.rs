use super::types::{FolderSize, SrcDstPath};
use async_trait::async_trait;
use tracing::warn;

/// What the executor knows when rsync exits with a space-related code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceExhaustion {
    pub message: String,
    pub exit_code: i32,
    pub paths: SrcDstPath,
    pub predicted_size: FolderSize,
    /// `None` when the destination could not be measured.
    pub free_space: Option<FolderSize>,
    /// Attempts already made for this block beyond the first one.
    pub repeat_count: usize,
    pub retries_left: usize,
}

impl SpaceExhaustion {
    /// Bytes the block needs beyond what is free. Zero when the block
    /// should have fit, `None` when free space is unknown.
    pub fn shortfall(&self) -> Option<FolderSize> {
        self.free_space
            .map(|free| self.predicted_size.saturating_sub(free))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Run the same block again. Costs one retry; treated as `Ignore` when none are left.
    Retry,
    /// Record the block as skipped and continue with the next one.
    Ignore,
    /// Stop the whole session.
    Abort,
}

/// Decides how a session reacts to a full destination. Implemented by the
/// interactive front end; the types below cover headless runs.
#[async_trait]
pub trait RecoveryHook: Send + Sync {
    async fn resolve_space_exhaustion(&self, ctx: &SpaceExhaustion) -> RecoveryDecision;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreSpaceExhaustion;

#[async_trait]
impl RecoveryHook for IgnoreSpaceExhaustion {
    async fn resolve_space_exhaustion(&self, ctx: &SpaceExhaustion) -> RecoveryDecision {
        let free = ctx
            .free_space
            .map_or_else(|| "unknown".to_string(), |f| f.to_string());
        warn!(
            "Skipping {} after exit code {}: needs {}, {} free",
            ctx.paths.src, ctx.exit_code, ctx.predicted_size, free
        );
        RecoveryDecision::Ignore
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnSpaceExhaustion;

#[async_trait]
impl RecoveryHook for AbortOnSpaceExhaustion {
    async fn resolve_space_exhaustion(&self, _ctx: &SpaceExhaustion) -> RecoveryDecision {
        RecoveryDecision::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(free_space: Option<FolderSize>) -> SpaceExhaustion {
        SpaceExhaustion {
            message: "No space left on device (28)".into(),
            exit_code: 23,
            paths: SrcDstPath::new("/src/big", "data/big"),
            predicted_size: FolderSize(1000),
            free_space,
            repeat_count: 0,
            retries_left: 3,
        }
    }

    #[test]
    fn test_shortfall() {
        assert_eq!(ctx(Some(FolderSize(400))).shortfall(), Some(FolderSize(600)));
        assert_eq!(ctx(Some(FolderSize(4000))).shortfall(), Some(FolderSize::ZERO));
        assert_eq!(ctx(None).shortfall(), None);
    }

    #[tokio::test]
    async fn test_headless_hooks_decide_without_measurement() {
        assert_eq!(
            IgnoreSpaceExhaustion.resolve_space_exhaustion(&ctx(None)).await,
            RecoveryDecision::Ignore
        );
        assert_eq!(
            AbortOnSpaceExhaustion.resolve_space_exhaustion(&ctx(None)).await,
            RecoveryDecision::Abort
        );
    }
}
