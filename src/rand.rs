//! Fast randomness for shuffle draws.

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::cell::RefCell;

thread_local! {
    /// A thread-local random number generator that is insecure but fast.
    pub(crate) static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_entropy());
}

/// Access a pre-initialized random number generator that is insecure but fast.
pub fn with_rng<F, R>(f: F) -> R
where
    F: FnOnce(&mut SmallRng) -> R,
{
    SMALL_RNG.with(|rng| {
        let mut rng = rng.borrow_mut();
        f(&mut rng)
    })
}

/// Draws an index with probability proportional to its weight.
///
/// Equivalent to materializing a pool in which index `i` appears
/// `weights[i]` times and picking one slot uniformly, without allocating
/// the pool. Zero weights are never drawn. Returns `None` when all weights
/// are zero or the slice is empty.
pub fn draw_weighted<R: Rng + ?Sized>(rng: &mut R, weights: &[u64]) -> Option<usize> {
    let total = weights
        .iter()
        .fold(0_u64, |total, weight| total.saturating_add(*weight));
    if total == 0 {
        return None;
    }

    let mut slot = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if slot < *weight {
            return Some(index);
        }
        slot -= weight;
    }

    // Only reachable when the total saturated.
    weights.iter().rposition(|weight| *weight > 0)
}
