// src/core/random.rs

//! Injected randomness. Cooldown jitter and anti-duplicate markers must be
//! reproducible in tests, so components draw from a `RandomSource` rather
//! than the thread RNG.

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub trait RandomSource: Send + Sync {
    /// A uniformly distributed value in `[0, 1)`.
    fn next_f64(&self) -> f64;

    /// A uniformly distributed 32-bit value.
    fn next_u32(&self) -> u32;

    /// A uniformly distributed value in `[low, high)`.
    fn uniform(&self, low: f64, high: f64) -> f64 {
        low + self.next_f64() * (high - low)
    }
}

/// Production randomness from the OS entropy pool.
#[derive(Debug, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }

    fn next_u32(&self) -> u32 {
        rand::random::<u32>()
    }
}

/// Deterministic randomness for tests, driven by a seeded `SmallRng`.
pub struct SeededRandom {
    rng: Mutex<SmallRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        self.rng.lock().r#gen::<f64>()
    }

    fn next_u32(&self) -> u32 {
        self.rng.lock().r#gen::<u32>()
    }
}
