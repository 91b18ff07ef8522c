use modsign_core::backup_store::BackupStoreError;
use modsign_core::state::StateError;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("no backups found for {0}")]
    NoBackups(String),
    #[error("backup {} rejected: {reason}", .backup.display())]
    BackupRejected { backup: PathBuf, reason: String },
    #[error("restored {} has {actual} bytes, backup has {expected}; reverted", .target.display())]
    SizeMismatch {
        target: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("cannot determine where {0} belongs; pass the module path explicitly")]
    TargetUnknown(String),
    #[error("i/o error on {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
    #[error(transparent)]
    Store(#[from] BackupStoreError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl RecoveryError {
    pub(crate) fn io(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}
