use crate::Generator;
use rand::distr::Alphanumeric;
use rand::Rng;
use snip_core::shortcode::SHORT_CODE_LENGTH;
use snip_core::ShortCode;

/// Draws codes uniformly from the 62-character alphanumeric alphabet.
#[derive(Debug, Clone, Copy)]
pub struct RandomGenerator {
    length: usize,
}

impl RandomGenerator {
    /// Creates a generator producing codes of `length` characters.
    pub fn new(length: usize) -> Self {
        Self { length }
    }
}

impl Default for RandomGenerator {
    fn default() -> Self {
        Self::new(SHORT_CODE_LENGTH)
    }
}

impl Generator for RandomGenerator {
    fn generate(&self) -> ShortCode {
        let code: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(self.length)
            .map(char::from)
            .collect();
        ShortCode::new_unchecked(code)
    }
}
