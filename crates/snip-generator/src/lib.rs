pub mod random;
pub mod seq;

pub use random::RandomGenerator;
pub use seq::SeqGenerator;

use snip_core::ShortCode;
use std::sync::Arc;

/// Trait for generating short codes.
///
/// Implementations are pure generators that don't interact with storage.
/// Collision handling belongs to the repository, which asks its generator
/// for a fresh code whenever a proposed one is taken.
pub trait Generator: Send + Sync + 'static {
    /// Generates a candidate short code.
    fn generate(&self) -> ShortCode;
}

impl<G: Generator + ?Sized> Generator for Arc<G> {
    fn generate(&self) -> ShortCode {
        (**self).generate()
    }
}
