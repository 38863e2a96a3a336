//! Geometric sampling math.
//!
//! The gate keeps a per-thread decrementing counter; when it hits zero a
//! fresh delay is drawn uniformly from `[1, sample_rate]`, which makes the
//! inter-sample distance geometric on average.
//!
//! The shared tunable is stored as `sample_rate + 1`. The zero-initialized
//! value then underflows to `u32::MAX` in the delay formula, so a pool that
//! was never initialized samples with vanishing probability without any
//! "am I initialized" branch on the hot path.

/// Stored tunable for an uninitialized (or stopped) pool.
pub const UNINITIALIZED_RATE_PLUS_ONE: u32 = 0;

/// Encode a validated sample rate into the stored `+1` form.
#[must_use]
pub const fn adjusted_rate_plus_one(sample_rate: u32) -> u32 {
    sample_rate + 1
}

/// Draw the next inter-sample delay from a 32-bit random value.
///
/// With the zero sentinel the modulus underflows to `u32::MAX`, yielding a
/// delay of up to ~2^32 allocations.
#[must_use]
pub const fn next_sample_delay(rand: u32, rate_plus_one: u32) -> u32 {
    (rand % rate_plus_one.wrapping_sub(1)) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prng;

    #[test]
    fn delay_is_within_the_configured_rate() {
        let rate_plus_one = adjusted_rate_plus_one(5000);
        let mut state = 0xdead_beef;
        for _ in 0..10_000 {
            let delay = next_sample_delay(prng::xorshift32(&mut state), rate_plus_one);
            assert!((1..=5000).contains(&delay));
        }
    }

    #[test]
    fn rate_one_samples_every_allocation() {
        let rate_plus_one = adjusted_rate_plus_one(1);
        for rand in [0u32, 1, 7, u32::MAX] {
            assert_eq!(next_sample_delay(rand, rate_plus_one), 1);
        }
    }

    #[test]
    fn zero_sentinel_draws_enormous_first_delay() {
        // The pre-init PRNG seed is chosen so the very first draw lands near
        // the top of the u32 range; an uninitialized gate then stays silent
        // for billions of calls.
        let mut state = prng::PRE_INIT_SEED;
        let first = prng::xorshift32(&mut state);
        let delay = next_sample_delay(first, UNINITIALIZED_RATE_PLUS_ONE);
        assert!(u64::from(delay) > 1 << 31);
    }

    #[test]
    fn delays_cover_the_full_range() {
        let rate_plus_one = adjusted_rate_plus_one(8);
        let mut seen = [false; 9];
        let mut state = 1u32;
        for _ in 0..10_000 {
            let delay = next_sample_delay(prng::xorshift32(&mut state), rate_plus_one);
            seen[delay as usize] = true;
        }
        assert!(seen[1..=8].iter().all(|&s| s));
    }
}
