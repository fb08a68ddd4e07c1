//! Probabilistic sampling of stats.
//!
//! A single process-wide xorshift64 generator backs every call. Its state lives in one atomic
//! word advanced with a compare-exchange loop, so concurrent callers never observe the same
//! value twice and no lock is taken on the hot path.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use portable_atomic::AtomicU64;

/// Generator state. Zero means "not seeded yet".
static STATE: AtomicU64 = AtomicU64::new(0);

/// Returns whether a stat sampled at `rate` should be sent.
///
/// A rate of `1.0` always passes without touching the random source. Otherwise the stat passes
/// with probability `rate`, so `0.0` (or anything negative) never passes.
pub fn can_sample(rate: f32) -> bool {
    rate == 1.0 || next_unit() < rate
}

/// Reseeds the shared generator, making the sequence of sampling decisions reproducible.
pub fn reseed(seed: u64) {
    STATE.store(seed | 1, Ordering::Release);
}

fn next_unit() -> f32 {
    // 24 bits is the full f32 mantissa, so every value in [0, 1) is equally likely.
    (next_random() >> 40) as f32 / (1u64 << 24) as f32
}

fn next_random() -> u64 {
    loop {
        let old = match STATE.load(Ordering::Acquire) {
            0 => initial_seed(),
            state => state,
        };

        let mut x = old;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;

        if STATE
            .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return x;
        }
    }
}

fn initial_seed() -> u64 {
    // Falls back to a fixed seed if the clock is before the epoch.
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15);
    seed | 1
}
