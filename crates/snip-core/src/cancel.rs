use crate::error::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fails with [`StorageError::Cancelled`] if the token has already fired.
///
/// Backends call this on entry, before touching any state.
pub fn ensure_active(cancel: &CancellationToken) -> Result<(), StorageError> {
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

/// Drives `fut` to completion unless `cancel` fires first.
///
/// On cancellation `fut` is dropped mid-flight, so any transaction it owns is
/// rolled back by its drop guard, and [`StorageError::Cancelled`] is returned.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    ensure_active(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        result = fut => result,
    }
}

/// Returns a child of `parent` that is cancelled once `timeout` elapses.
///
/// Must be called from within a Tokio runtime.
pub fn deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}
