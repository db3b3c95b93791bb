//! URL shortening service.
//!
//! Ties a storage backend, a code generator and a task engine together.
//! Bulk deletions are handed to the engine and applied in the background by
//! the [`deletion::DeletionPipeline`].

pub mod deletion;
pub mod error;
pub mod service;
pub mod validate;

pub use deletion::{DeletionPipeline, DeletionReport, DeletionTask, ShortenerTask, ShortenerTaskKind};
pub use error::SnapshotError;
pub use service::{BatchShortenRequest, BatchShortenResult, ServiceSettings, UrlService, UserUrl};
pub use snip_core::ShortenerError;
pub use validate::validate_url;
