//! Core types and traits for the snip URL shortener.
//!
//! This crate provides the record model, the validated short code type,
//! the shared error taxonomy and the repository contract implemented by
//! every storage backend.

pub mod cancel;
pub mod error;
pub mod repository;
pub mod shortcode;

pub use cancel::{deadline, ensure_active, run_cancellable};
pub use error::{ShortenerError, StorageError};
pub use repository::{Inserted, ReadRepository, Repository, UrlRecord};
pub use shortcode::ShortCode;

/// Re-exported so downstream crates agree on a single cancellation type.
pub use tokio_util::sync::CancellationToken;
