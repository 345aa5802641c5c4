//! Cancellable contexts for backup sessions and source probes.
//!
//! Every long running operation gets its own [`ContextPack`], forked from a
//! parent token so that cancelling the parent cancels every child. Live packs
//! are tracked in a [`RunningContexts`] registry; the [`ContextGuard`] handed
//! out by [`RunningContexts::fork`] deregisters its pack when dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ContextPack {
    id: Uuid,
    token: CancellationToken,
}

impl ContextPack {
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            token: parent.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Thread-safe registry of live contexts.
#[derive(Debug, Clone, Default)]
pub struct RunningContexts {
    packs: Arc<Mutex<Vec<ContextPack>>>,
}

impl RunningContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, pack: ContextPack) {
        self.packs.lock().push(pack);
    }

    pub fn remove(&self, id: Uuid) -> Option<ContextPack> {
        let mut packs = self.packs.lock();
        let pos = packs.iter().position(|p| p.id == id)?;
        Some(packs.remove(pos))
    }

    pub fn find(&self, id: Uuid) -> Option<ContextPack> {
        self.packs.lock().iter().find(|p| p.id == id).cloned()
    }

    /// Cancels one context. Returns false if it is not registered.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.find(id) {
            Some(pack) => {
                pack.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let packs = self.packs.lock();
        debug!("Cancelling {} running contexts", packs.len());
        for pack in packs.iter() {
            pack.cancel();
        }
    }

    pub fn count(&self) -> usize {
        self.packs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Forks a child of `parent`, registers it and returns a guard that
    /// removes it again when dropped.
    pub fn fork(&self, parent: &CancellationToken) -> ContextGuard {
        let pack = ContextPack::new(parent);
        self.add(pack.clone());
        ContextGuard {
            pack,
            registry: self.clone(),
        }
    }
}

pub struct ContextGuard {
    pack: ContextPack,
    registry: RunningContexts,
}

impl ContextGuard {
    pub fn id(&self) -> Uuid {
        self.pack.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.pack.token
    }

    pub fn cancel(&self) {
        self.pack.cancel();
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.registry.remove(self.pack.id);
    }
}

/// Tracks whether a backup session is running and lets it be interrupted.
#[derive(Debug, Clone)]
pub struct BackupSessionStatus {
    parent: CancellationToken,
    running: RunningContexts,
}

impl Default for BackupSessionStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupSessionStatus {
    pub fn new() -> Self {
        Self::with_parent(CancellationToken::new())
    }

    /// Sessions started here are cancelled together with `parent`.
    pub fn with_parent(parent: CancellationToken) -> Self {
        Self {
            parent,
            running: RunningContexts::new(),
        }
    }

    /// Context for a new session. The session counts as running until the guard is dropped.
    pub fn start(&self) -> ContextGuard {
        self.running.fork(&self.parent)
    }

    pub fn is_running(&self) -> bool {
        !self.running.is_empty()
    }

    /// Interrupts every running session.
    pub fn stop(&self) {
        self.running.cancel_all();
    }

    /// Cancels the parent context: running and future sessions start cancelled.
    pub fn shutdown(&self) {
        self.parent.cancel();
    }
}
