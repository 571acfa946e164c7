//! Uniform random draws used for backoff, p-persistence, channel choice and
//! response diversity.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_core::OsRng;

pub trait RandomSource {
    /// Uniform value in `[0, 1)`.
    fn unit(&mut self) -> f32;

    /// Uniform value in `[min, max]`. Returns `min` when `max < min`.
    fn range_inclusive(&mut self, min: u32, max: u32) -> u32;

    /// Uniform index in `[0, len)`. `len` must be non-zero.
    fn index(&mut self, len: usize) -> usize;
}

/// [`RandomSource`] over any `rand` generator.
#[derive(Debug, Clone)]
pub struct RngSource<R>(R);

impl<R: RngCore> RngSource<R> {
    pub fn new(rng: R) -> Self {
        Self(rng)
    }
}

impl RngSource<StdRng> {
    /// Generator seeded from the operating system.
    pub fn from_os() -> Result<Self, rand::Error> {
        Ok(Self(StdRng::from_rng(OsRng)?))
    }

    /// Deterministic generator for simulations.
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl<R: RngCore> RandomSource for RngSource<R> {
    fn unit(&mut self) -> f32 {
        self.0.gen::<f32>()
    }

    fn range_inclusive(&mut self, min: u32, max: u32) -> u32 {
        if max <= min {
            return min;
        }
        self.0.gen_range(min..=max)
    }

    fn index(&mut self, len: usize) -> usize {
        self.0.gen_range(0..len.max(1))
    }
}
