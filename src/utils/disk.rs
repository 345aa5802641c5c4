use std::io;
use std::path::Path;

/// Free-space measurement of the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    fn free_space(&self, path: &Path) -> io::Result<u64>;
}

/// Measures through `fs2`. Reports space available to unprivileged users.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2Probe;

impl SpaceProbe for Fs2Probe {
    fn free_space(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(nearest_existing(path))
    }
}

/// `path` itself, or its closest ancestor that exists.
fn nearest_existing(path: &Path) -> &Path {
    path.ancestors()
        .find(|p| p.exists())
        .unwrap_or(path)
}
