use crate::error::{EngineError, TaskError};
use crate::monitor::{MonitoringSnapshot, Stats, WorkerState};
use crate::task::{Task, TaskHandler};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

#[derive(Debug, Clone, TypedBuilder)]
pub struct EngineSettings {
    /// Number of workers pulling from the queue.
    #[builder(default = 4)]
    pub workers: usize,
    /// Capacity of the task queue. `enqueue` waits once it is full.
    #[builder(default = 100)]
    pub queue_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

type HandlerTable<T> = RwLock<HashMap<<T as Task>::Kind, Arc<dyn TaskHandler<T>>>>;

struct Shared<T: Task> {
    handlers: HandlerTable<T>,
    stats: Stats,
    /// Hard cancellation. Workers stop after their current task.
    cancel: CancellationToken,
}

impl<T: Task> Shared<T> {
    fn handler_for(&self, kind: &T::Kind) -> Option<Arc<dyn TaskHandler<T>>> {
        self.handlers.read().get(kind).cloned()
    }
}

type SharedReceiver<T> = Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>;

/// Bounded pool of workers dispatching tasks to per-kind handlers.
///
/// Tasks are started in FIFO order. With more than one worker they may
/// complete in any order.
pub struct TaskEngine<T: Task> {
    shared: Arc<Shared<T>>,
    worker_count: usize,
    sender: Mutex<Option<mpsc::Sender<T>>>,
    receiver: SharedReceiver<T>,
    /// Taken by the first `shutdown` call, which hands them to the teardown.
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
    /// Fired when shutdown starts so blocked submitters give up.
    closing: CancellationToken,
    /// Fired once every worker has exited and the queue is empty.
    stopped: CancellationToken,
}

impl<T: Task> TaskEngine<T> {
    /// Starts the workers. Must be called from within a tokio runtime.
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_parent(settings, &CancellationToken::new())
    }

    /// Like [`TaskEngine::new`], with hard cancellation tied to `parent`.
    pub fn with_parent(settings: EngineSettings, parent: &CancellationToken) -> Self {
        let workers = settings.workers.max(1);
        let (sender, receiver) = mpsc::channel(settings.queue_size.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(Shared {
            handlers: RwLock::new(HashMap::new()),
            stats: Stats::new(workers),
            cancel: parent.child_token(),
        });

        let handles = (0..workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared), Arc::clone(&receiver))))
            .collect();

        info!(workers, queue_size = settings.queue_size, "task engine started");

        Self {
            shared,
            worker_count: workers,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Some(handles)),
            closing: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    /// Routes tasks of `kind` to `handler`, replacing any previous handler.
    pub fn register_handler<H>(&self, kind: T::Kind, handler: H)
    where
        H: TaskHandler<T>,
    {
        let previous = self.shared.handlers.write().insert(kind, Arc::new(handler));
        if previous.is_some() {
            warn!(?kind, "replaced task handler");
        } else {
            debug!(?kind, "registered task handler");
        }
    }

    /// Places `task` on the queue, waiting while the queue is full.
    ///
    /// Fails without waiting when no handler is registered for the task's
    /// kind. Returns [`EngineError::Cancelled`] if `cancel` fires first.
    pub async fn enqueue(&self, task: T, cancel: &CancellationToken) -> Result<(), EngineError> {
        let kind = task.kind();
        if self.shared.handler_for(&kind).is_none() {
            return Err(EngineError::NoHandler(format!("{kind:?}")));
        }
        if self.closing.is_cancelled() || self.shared.cancel.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let sender = self.sender.lock().clone().ok_or(EngineError::ShutDown)?;

        let permit = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(EngineError::ShutDown),
            _ = self.closing.cancelled() => return Err(EngineError::ShutDown),
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = sender.reserve() => permit.map_err(|_| EngineError::ShutDown)?,
        };

        self.shared.stats.task_queued();
        permit.send(task);
        debug!(?kind, "task enqueued");
        Ok(())
    }

    /// Stops accepting tasks, lets the workers drain the queue and waits for
    /// them to exit.
    ///
    /// Safe to call more than once and from several places at the same
    /// time. The teardown runs in its own task, so dropping a `shutdown`
    /// future early does not cut it short: every call returns only once all
    /// workers have stopped.
    pub async fn shutdown(&self) {
        let handles = self.workers.lock().take();
        if let Some(handles) = handles {
            info!("task engine shutting down");
            self.closing.cancel();
            drop(self.sender.lock().take());

            tokio::spawn(teardown(
                handles,
                Arc::clone(&self.shared),
                Arc::clone(&self.receiver),
                self.stopped.clone(),
            ));
        }

        self.stopped.cancelled().await;
    }

    /// Hard cancellation: in-flight handlers see their token fire, workers
    /// exit after their current task and queued tasks are dropped.
    pub fn cancel(&self) {
        warn!("task engine cancelled");
        self.shared.cancel.cancel();
    }

    /// Number of workers the engine was started with.
    pub fn workers(&self) -> usize {
        self.worker_count
    }

    pub fn monitor(&self) -> MonitoringSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared.stats.worker_states()
    }
}

async fn teardown<T: Task>(
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared<T>>,
    receiver: SharedReceiver<T>,
    stopped: CancellationToken,
) {
    for (id, handle) in handles.into_iter().enumerate() {
        if let Err(err) = handle.await {
            error!(worker = id, error = %err, "worker exited abnormally");
        }
    }

    // Only non-empty after a hard cancel.
    let dropped = {
        let mut receiver = receiver.lock().await;
        receiver.close();

        let mut dropped = 0;
        while let Ok(task) = receiver.try_recv() {
            shared.stats.task_dequeued();
            warn!(kind = ?task.kind(), "dropping queued task");
            dropped += 1;
        }
        dropped
    };

    let snapshot = shared.stats.snapshot();
    info!(
        processed = snapshot.processed,
        errors = snapshot.errors,
        dropped,
        "task engine stopped"
    );
    stopped.cancel();
}

async fn run_worker<T: Task>(id: usize, shared: Arc<Shared<T>>, receiver: SharedReceiver<T>) {
    debug!(worker = id, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => None,
            task = async { receiver.lock().await.recv().await } => task,
        };
        let Some(task) = next else { break };

        shared.stats.task_dequeued();
        shared.stats.task_started(id);
        let failed = execute(id, &shared, task).await.is_err();
        shared.stats.task_finished(id, failed);
    }

    shared.stats.set_state(id, WorkerState::Stopped);
    debug!(worker = id, "worker stopped");
}

async fn execute<T: Task>(id: usize, shared: &Shared<T>, task: T) -> Result<(), TaskError> {
    let kind = task.kind();
    let Some(handler) = shared.handler_for(&kind) else {
        error!(worker = id, ?kind, "no handler for dequeued task");
        return Err(TaskError::failed(format!("no handler for {kind:?}")));
    };

    let outcome = AssertUnwindSafe(handler.handle(task, shared.cancel.child_token()))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));

    match &outcome {
        Ok(()) => debug!(worker = id, ?kind, "task completed"),
        Err(err) => error!(worker = id, ?kind, error = %err, "task failed"),
    }
    outcome
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
