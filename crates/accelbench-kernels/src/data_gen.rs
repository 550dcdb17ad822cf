use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed used by every workload so runs are reproducible.
pub const DEFAULT_SEED: u64 = 42;

/// Deterministic data generator seeded for reproducible benchmarks.
pub struct DataGenerator {
    rng: StdRng,
}

impl Default for DataGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl DataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// `count` uniformly distributed values in [0.0, 1.0).
    pub fn uniform_f32(&mut self, count: usize) -> Vec<f32> {
        (0..count).map(|_| self.rng.gen::<f32>()).collect()
    }

    /// `count` uniformly distributed values in [lo, hi).
    pub fn range_f32(&mut self, count: usize, lo: f32, hi: f32) -> Vec<f32> {
        (0..count).map(|_| self.rng.gen_range(lo..hi)).collect()
    }
}
