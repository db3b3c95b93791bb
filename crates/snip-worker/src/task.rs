use crate::error::TaskError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use tokio_util::sync::CancellationToken;

/// A unit of work the engine can route.
///
/// The kind selects the handler. Implementors are usually an enum whose
/// variants carry the payload and whose `Kind` is a fieldless mirror of it.
pub trait Task: Send + 'static {
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Executes tasks of one kind.
///
/// `cancel` fires when the engine is hard-cancelled. A graceful shutdown lets
/// the handler run to completion.
#[async_trait]
pub trait TaskHandler<T: Task>: Send + Sync + 'static {
    async fn handle(&self, task: T, cancel: CancellationToken) -> Result<(), TaskError>;
}

/// Adapts an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<T, F, Fut>(f: F) -> FnHandler<F>
where
    T: Task,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<T, F, Fut> TaskHandler<T> for FnHandler<F>
where
    T: Task,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    async fn handle(&self, task: T, cancel: CancellationToken) -> Result<(), TaskError> {
        (self.0)(task, cancel).await
    }
}
