//! Fee model.
//!
//! A fixed virtual-size estimate rather than a dry-run signing pass:
//!
//! ```text
//! vbytes = BASE_TX_VBYTES + inputs × INPUT_VBYTES
//! fee    = max(floor(fee_rate × vbytes), MIN_FEE_SATS)
//! ```
//!
//! The base figure is sized for a full 80-byte annotation plus a change
//! output, so the estimate errs slightly high for short notes.

use crate::config::{BASE_TX_VBYTES, DUST_THRESHOLD_SATS, INPUT_VBYTES, MIN_FEE_SATS};

/// Estimated virtual size of a note transaction with `input_count` inputs.
pub fn estimate_vbytes(input_count: usize) -> u64 {
    BASE_TX_VBYTES + input_count as u64 * INPUT_VBYTES
}

/// Fee in satoshis for `input_count` inputs at `fee_rate` sat/vB.
///
/// Non-decreasing in `input_count` for any fixed rate, and never below
/// [`MIN_FEE_SATS`]. Callers validate the rate; a NaN or negative rate
/// simply lands on the floor.
pub fn estimate_fee(fee_rate: f64, input_count: usize) -> u64 {
    let raw = (fee_rate * estimate_vbytes(input_count) as f64).floor();
    // `as` saturates: NaN and negatives become 0, huge values become u64::MAX.
    (raw as u64).max(MIN_FEE_SATS)
}

/// What the first selected inputs must add up to before selection stops:
/// the mailbox dust plus the single-input fee.
pub fn selection_target(fee_rate: f64) -> u64 {
    DUST_THRESHOLD_SATS + estimate_fee(fee_rate, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_applies_at_low_rates() {
        assert_eq!(estimate_fee(0.0, 1), MIN_FEE_SATS);
        assert_eq!(estimate_fee(0.5, 1), MIN_FEE_SATS);
    }

    #[test]
    fn one_input_at_two_sat_per_vbyte() {
        // (165 + 68) × 2 = 466
        assert_eq!(estimate_fee(2.0, 1), 466);
        assert_eq!(selection_target(2.0), 546 + 466);
    }

    #[test]
    fn fractional_rates_are_floored() {
        // 233 × 1.5 = 349.5
        assert_eq!(estimate_fee(1.5, 1), 349);
    }

    #[test]
    fn fee_is_monotonic_in_inputs() {
        for rate in [0.0, 0.7, 1.0, 2.5, 10.0, 150.0] {
            let mut prev = 0;
            for n in 0..20 {
                let fee = estimate_fee(rate, n);
                assert!(fee >= prev, "rate {rate}, {n} inputs");
                prev = fee;
            }
        }
    }

    #[test]
    fn degenerate_rates_land_on_floor() {
        assert_eq!(estimate_fee(f64::NAN, 2), MIN_FEE_SATS);
        assert_eq!(estimate_fee(-3.0, 2), MIN_FEE_SATS);
    }
}
