//! Weighted selection over a rolling window.

use parking_lot::Mutex;
use rand::Rng;

use crate::error::ConfigError;

#[derive(Debug)]
struct Window {
    /// Remaining picks per downstream in the current window.
    remaining: Vec<u32>,
    /// Next position to inspect (round-robin mode).
    cursor: usize,
}

/// Distributes picks in proportion to integer weights.
///
/// Every downstream has as many picks per window as its weight. In
/// round-robin mode the selector walks the weight list in order, taking one
/// pick from each downstream that still has capacity and skipping exhausted
/// ones; in random mode it draws uniformly among the remaining picks. The
/// window resets once every pick is used.
#[derive(Debug)]
pub struct WeightedSelector {
    weights: Vec<u32>,
    round_robin: bool,
    window: Mutex<Window>,
}

impl WeightedSelector {
    /// # Errors
    ///
    /// Fails when the weight count differs from `downstreams` or every
    /// weight is zero.
    pub fn new(weights: Vec<u32>, downstreams: usize, round_robin: bool) -> Result<Self, ConfigError> {
        if weights.len() != downstreams {
            return Err(ConfigError::WeightMismatch {
                expected: downstreams,
                actual: weights.len(),
            });
        }
        if weights.iter().all(|w| *w == 0) {
            return Err(ConfigError::ZeroWeights);
        }
        Ok(Self {
            window: Mutex::new(Window {
                remaining: weights.clone(),
                cursor: 0,
            }),
            weights,
            round_robin,
        })
    }

    #[must_use]
    pub fn weights(&self) -> &[u32] {
        &self.weights
    }

    /// Picks the next downstream index.
    pub fn select(&self) -> usize {
        let mut window = self.window.lock();
        if window.remaining.iter().all(|r| *r == 0) {
            window.remaining.clone_from(&self.weights);
            window.cursor = 0;
        }

        let index = if self.round_robin {
            Self::next_in_order(&mut window)
        } else {
            Self::next_at_random(&window)
        };
        window.remaining[index] -= 1;
        index
    }

    fn next_in_order(window: &mut Window) -> usize {
        let len = window.remaining.len();
        loop {
            if window.cursor >= len {
                window.cursor = 0;
            }
            let index = window.cursor;
            window.cursor += 1;
            if window.remaining[index] > 0 {
                return index;
            }
        }
    }

    fn next_at_random(window: &Window) -> usize {
        // Totals can exceed u32::MAX.
        let total: u64 = window.remaining.iter().map(|r| u64::from(*r)).sum();
        let mut pick = rand::rng().random_range(0..total);
        for (index, remaining) in window.remaining.iter().enumerate() {
            let remaining = u64::from(*remaining);
            if pick < remaining {
                return index;
            }
            pick -= remaining;
        }
        // Unreachable while `total` matches the remaining picks.
        window.remaining.iter().position(|r| *r > 0).unwrap_or(0)
    }
}
