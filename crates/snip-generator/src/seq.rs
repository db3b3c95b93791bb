use crate::Generator;
use snip_core::shortcode::SHORT_CODE_LENGTH;
use snip_core::ShortCode;
use std::sync::atomic::{AtomicU64, Ordering};

/// A deterministic generator using a sequential counter.
///
/// Produces codes like `sq000000`, `sq000001`, ... padded so that every code
/// is [`SHORT_CODE_LENGTH`] characters. Handy for reproducible tests and for
/// seeding a collision on purpose.
#[derive(Debug)]
pub struct SeqGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl SeqGenerator {
    /// Creates a generator with a custom alphanumeric prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self::with_offset(prefix, 0)
    }

    /// Creates a generator starting from a specific counter value.
    pub fn with_offset(prefix: impl Into<String>, offset: u64) -> Self {
        Self {
            counter: AtomicU64::new(offset),
            prefix: prefix.into(),
        }
    }
}

impl Generator for SeqGenerator {
    fn generate(&self) -> ShortCode {
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        let width = SHORT_CODE_LENGTH.saturating_sub(self.prefix.len());
        ShortCode::new_unchecked(format!("{}{:0width$}", self.prefix, count, width = width))
    }
}
