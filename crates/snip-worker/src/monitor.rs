use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitoringSnapshot {
    /// Tasks accepted but not yet picked up by a worker.
    pub queue_length: usize,
    /// Tasks a worker finished, successfully or not.
    pub processed: u64,
    /// Tasks whose handler returned an error or panicked.
    pub errors: u64,
    /// Workers currently running a handler.
    pub active_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Processing = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Processing,
            _ => Self::Stopped,
        }
    }
}

/// Counters shared between the engine handle and its workers.
#[derive(Debug)]
pub(crate) struct Stats {
    queued: AtomicUsize,
    processed: AtomicU64,
    errors: AtomicU64,
    active: AtomicUsize,
    workers: Vec<AtomicU8>,
}

impl Stats {
    pub(crate) fn new(workers: usize) -> Self {
        Self {
            queued: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            workers: (0..workers)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
        }
    }

    pub(crate) fn task_queued(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn task_dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn task_started(&self, worker: usize) {
        self.active.fetch_add(1, Ordering::AcqRel);
        self.set_state(worker, WorkerState::Processing);
    }

    pub(crate) fn task_finished(&self, worker: usize, failed: bool) {
        if failed {
            self.errors.fetch_add(1, Ordering::AcqRel);
        }
        self.processed.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.set_state(worker, WorkerState::Idle);
    }

    pub(crate) fn set_state(&self, worker: usize, state: WorkerState) {
        if let Some(slot) = self.workers.get(worker) {
            slot.store(state as u8, Ordering::Release);
        }
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        self.workers
            .iter()
            .map(|slot| WorkerState::from_u8(slot.load(Ordering::Acquire)))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> MonitoringSnapshot {
        MonitoringSnapshot {
            queue_length: self.queued.load(Ordering::Acquire),
            processed: self.processed.load(Ordering::Acquire),
            errors: self.errors.load(Ordering::Acquire),
            active_workers: self.active.load(Ordering::Acquire),
        }
    }
}
