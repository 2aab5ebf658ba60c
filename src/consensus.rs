//! Consensus parameter set and proof-of-work evaluation.
//!
//! The surrounding network fixes these values per chain; everything the core
//! needs to validate a block given its height lives here. Difficulty is a
//! per-chain constant (`base_bits`); retargeting is the outer consensus
//! layer's concern.

use crate::types::Hash;

pub const COINBASE_MATURITY: u64 = 60;
pub const SUBSIDY_BASE: u64 = 80_000_000;
pub const SUBSIDY_HALF_LIFE: u64 = 1_050_000;
pub const TIMESTAMP_MEDIAN_SPAN: usize = 11;
pub const MAX_TIMESTAMP_DRIFT_SECS: u64 = 7_200;

/// Parameters the processor consults while validating and assembling blocks.
#[derive(Clone, Copy, Debug)]
pub struct ChainParams {
    pub base_bits: u32,
    pub coinbase_maturity: u64,
    pub median_span: usize,
    pub max_drift_secs: u64,
}

impl ChainParams {
    pub fn with_base_bits(base_bits: u32) -> Self {
        Self {
            base_bits,
            coinbase_maturity: COINBASE_MATURITY,
            median_span: TIMESTAMP_MEDIAN_SPAN,
            max_drift_secs: MAX_TIMESTAMP_DRIFT_SECS,
        }
    }

    pub fn for_genesis(genesis: &crate::config::GenesisConfig) -> Self {
        Self {
            coinbase_maturity: genesis.coinbase_maturity,
            ..Self::with_base_bits(genesis.base_bits)
        }
    }

    /// Difficulty the chain expects for a block at `_height`. Constant for
    /// now; the signature keeps call sites honest about what they ask for.
    pub fn expected_bits(&self, _height: u64) -> u32 {
        self.base_bits
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::with_base_bits(0)
    }
}

/// Emission for the coinbase of a block at `height`, halving every
/// `SUBSIDY_HALF_LIFE` blocks until it runs out.
pub fn block_subsidy(height: u64) -> u64 {
    let halvings = height / SUBSIDY_HALF_LIFE;
    if halvings >= 64 {
        return 0;
    }
    SUBSIDY_BASE >> halvings
}

/// Work contributed by a block mined at `bits` leading zero bits.
pub fn work_for_bits(bits: u32) -> u128 {
    1u128 << bits.min(127)
}

/// Number of leading zero bits in a digest.
fn leading_zero_bits(digest: &Hash) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros();
            break;
        }
    }
    count
}

/// Whether `digest` satisfies a difficulty of `bits` leading zero bits.
pub fn pow_meets_target(digest: &Hash, bits: u32) -> bool {
    leading_zero_bits(digest) >= bits
}

/// Median of the timestamps of up to `span` most recent ancestors. The input
/// is ordered tip-first; an empty slice yields 0 so genesis always passes.
pub fn median_time_past(ancestors: &[u64], span: usize) -> u64 {
    let mut window: Vec<u64> = ancestors.iter().take(span).copied().collect();
    if window.is_empty() {
        return 0;
    }
    window.sort_unstable();
    window[window.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves_and_runs_out() {
        assert_eq!(block_subsidy(0), SUBSIDY_BASE);
        assert_eq!(block_subsidy(SUBSIDY_HALF_LIFE - 1), SUBSIDY_BASE);
        assert_eq!(block_subsidy(SUBSIDY_HALF_LIFE), SUBSIDY_BASE / 2);
        assert_eq!(block_subsidy(SUBSIDY_HALF_LIFE * 64), 0);
    }

    #[test]
    fn pow_counts_leading_zero_bits() {
        let mut digest = [0xffu8; 32];
        assert!(pow_meets_target(&digest, 0));
        assert!(!pow_meets_target(&digest, 1));
        digest[0] = 0x0f;
        assert!(pow_meets_target(&digest, 4));
        assert!(!pow_meets_target(&digest, 5));
        assert!(pow_meets_target(&[0u8; 32], 256));
    }

    #[test]
    fn median_takes_middle_of_window() {
        assert_eq!(median_time_past(&[], 11), 0);
        assert_eq!(median_time_past(&[7], 11), 7);
        assert_eq!(median_time_past(&[30, 10, 20], 11), 20);
        // only the most recent `span` entries count
        assert_eq!(median_time_past(&[5, 6, 100, 200, 300], 2), 6);
    }
}
