use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use snip_core::{CancellationToken, Repository, ShortCode, StorageError};
use snip_worker::{Task, TaskError, TaskHandler};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{error, info};

/// Codes deleted per store call.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Batches of one task applied at the same time.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Soft-deletes `codes` on behalf of `owner_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionTask {
    pub owner_id: String,
    pub codes: Vec<ShortCode>,
}

/// Background work the shortener hands to the task engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShortenerTask {
    DeleteUrls(DeletionTask),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShortenerTaskKind {
    DeleteUrls,
}

impl Display for ShortenerTaskKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ShortenerTaskKind::DeleteUrls => write!(f, "delete_urls"),
        }
    }
}

impl Task for ShortenerTask {
    type Kind = ShortenerTaskKind;

    fn kind(&self) -> ShortenerTaskKind {
        match self {
            ShortenerTask::DeleteUrls(_) => ShortenerTaskKind::DeleteUrls,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub codes: Vec<ShortCode>,
    pub error: StorageError,
}

/// What happened to each batch of a [`DeletionTask`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub succeeded: Vec<Vec<ShortCode>>,
    pub failed: Vec<BatchFailure>,
}

impl DeletionReport {
    pub fn batches(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Applies deletion tasks to a repository in fixed-size batches.
///
/// Batches are independent: one failing never undoes another.
#[derive(Debug)]
pub struct DeletionPipeline<R> {
    repository: Arc<R>,
    batch_size: usize,
    concurrency: usize,
}

impl<R: Repository> DeletionPipeline<R> {
    pub fn new(repository: Arc<R>) -> Self {
        Self {
            repository,
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self, task: &DeletionTask, cancel: &CancellationToken) -> DeletionReport {
        info!(owner = %task.owner_id, codes = task.codes.len(), "starting deletion task");

        let batches: Vec<Vec<ShortCode>> = task
            .codes
            .chunks(self.batch_size)
            .map(<[ShortCode]>::to_vec)
            .collect();

        let outcomes: Vec<_> = stream::iter(batches)
            .map(|batch| {
                let repository = Arc::clone(&self.repository);
                let owner = task.owner_id.clone();
                let cancel = cancel.clone();
                async move {
                    let result = repository
                        .delete_by_owner_and_codes(&owner, &batch, &cancel)
                        .await;
                    (batch, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = DeletionReport::default();
        for (codes, result) in outcomes {
            match result {
                Ok(()) => {
                    info!(owner = %task.owner_id, batch = ?codes, "batch deleted");
                    report.succeeded.push(codes);
                }
                Err(error) => {
                    error!(owner = %task.owner_id, batch = ?codes, %error, "batch deletion failed");
                    report.failed.push(BatchFailure { codes, error });
                }
            }
        }

        info!(
            owner = %task.owner_id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "deletion task finished"
        );
        report
    }
}

#[async_trait]
impl<R: Repository> TaskHandler<ShortenerTask> for DeletionPipeline<R> {
    async fn handle(&self, task: ShortenerTask, cancel: CancellationToken) -> Result<(), TaskError> {
        let ShortenerTask::DeleteUrls(task) = task;

        let report = self.run(&task, &cancel).await;
        if report.is_success() {
            return Ok(());
        }

        if report.failed.iter().all(|f| f.error == StorageError::Cancelled) {
            return Err(TaskError::Cancelled);
        }
        Err(TaskError::failed(format!(
            "{} of {} deletion batches failed for owner {}",
            report.failed.len(),
            report.batches(),
            task.owner_id
        )))
    }
}
