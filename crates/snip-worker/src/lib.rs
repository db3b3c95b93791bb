//! A bounded worker pool executing typed tasks off the request path.
//!
//! Tasks are pushed onto a bounded queue with [`TaskEngine::enqueue`] and
//! pulled by a fixed set of workers. Each task kind is routed to the
//! [`TaskHandler`] registered for it on the engine instance. Handler failures
//! and panics are contained per task.

pub mod engine;
pub mod error;
pub mod monitor;
pub mod task;

pub use engine::{EngineSettings, TaskEngine};
pub use error::{EngineError, TaskError};
pub use monitor::{MonitoringSnapshot, WorkerState};
pub use task::{handler_fn, FnHandler, Task, TaskHandler};
