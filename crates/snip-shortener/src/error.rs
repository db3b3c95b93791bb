use snip_core::ShortenerError;
use snip_storage::BackupError;
use thiserror::Error;

/// Failure while restoring or saving a snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(transparent)]
    Service(#[from] ShortenerError),
}
