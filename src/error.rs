//! Error types for planning and running backup sessions.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path is not a directory: {0}")]
    NotADirectory(String),

    #[error("Failed to inquire {path}: {message}")]
    Inquiry { path: String, message: String },

    /// The owning context was cancelled. Not a defect of the plan or the source.
    #[error("Process terminated")]
    ProcessTerminated,

    #[error("Failed to start rsync: {0}")]
    RsyncSpawn(String),

    #[error("Not enough space at destination: block needs {required} bytes, {available} bytes free")]
    SpaceExhausted { required: u64, available: u64 },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl BackupError {
    /// True when the error only reports cancellation of the surrounding context.
    pub fn is_terminated(&self) -> bool {
        matches!(self, BackupError::ProcessTerminated)
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_is_distinguished() {
        assert!(BackupError::ProcessTerminated.is_terminated());
        assert!(!BackupError::NotADirectory("/tmp/x".into()).is_terminated());
        assert!(!BackupError::Inquiry {
            path: "host::mod".into(),
            message: "auth failed".into(),
        }
        .is_terminated());
    }

    #[test]
    fn test_space_message_has_both_sizes() {
        let err = BackupError::SpaceExhausted {
            required: 1_000,
            available: 500,
        };
        let text = err.to_string();
        assert!(text.contains("1000"));
        assert!(text.contains("500"));
    }
}
