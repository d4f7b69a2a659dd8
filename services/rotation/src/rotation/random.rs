//! Random choice capability used to pick the next assignee.

use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks a uniformly distributed index into a candidate list.
pub trait RandomSource: Send + Sync {
    /// Returns an index in `0..len`. Callers never pass `len == 0`.
    fn choose_index(&self, len: usize) -> usize;
}

/// Thread-local generator seeded from the OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn choose_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        rand::rng().random_range(0..len)
    }
}

/// Deterministic generator for tests and reproducible runs.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn choose_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_sequence() {
        let a = SeededRandom::new(42);
        let b = SeededRandom::new(42);
        let left: Vec<usize> = (0..32).map(|_| a.choose_index(7)).collect();
        let right: Vec<usize> = (0..32).map(|_| b.choose_index(7)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_indices_stay_in_range() {
        let source = SeededRandom::new(7);
        assert!((0..1000).all(|_| source.choose_index(3) < 3));
        assert!((0..100).all(|_| ThreadRandom.choose_index(5) < 5));
        assert_eq!(ThreadRandom.choose_index(1), 0);
    }

    #[test]
    fn test_every_candidate_reachable() {
        let source = SeededRandom::new(1);
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[source.choose_index(4)] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }
}
