//! Perch DSP - Equalizer Filter Chain
//!
//! The ingest-side DSP seam: a configurable cascade of BiQuad filters
//! applied in place to s16le PCM before fan-out. Follows a strict
//! "no allocation in the process path" rule; all validation and coefficient
//! computation happens when the chain is built.

mod error;
mod filter;

pub use error::{DspError, DspResult};
pub use filter::{FilterChain, FilterSpec, FilterType};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let chain = FilterChain::from_specs(&[], 48000.0).unwrap();
        assert!(chain.is_passthrough());
    }
}
