use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

/// A reproducible, fast, non-cryptographic random number generator for Monte Carlo sampling.
/// A `seed` has to be set, which can be any `u64` number (small numbers work just as well as large numbers).
///
/// Independent generators, for example one for drawing points and one for
/// initialising conditioner weights, should share the `seed` but use a different `stream_id`.
#[derive(Debug, Clone)]
pub struct MonteCarloRng {
    state: Xoshiro256StarStar,
}

impl RngCore for MonteCarloRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.state.next_u32()
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.state.next_u64()
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.state.fill_bytes(dest)
    }

    #[inline]
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.state.try_fill_bytes(dest)
    }
}

impl MonteCarloRng {
    /// Create a new random number generator with a given `seed` and `stream_id`.
    /// Streams are separated by `2^128` draws.
    pub fn new(seed: u64, stream_id: usize) -> Self {
        let mut state = Xoshiro256StarStar::seed_from_u64(seed);
        for _ in 0..stream_id {
            state.jump();
        }

        Self { state }
    }

    /// Draw `n` points uniformly from the unit hypercube of dimension `dims`.
    pub fn uniform_points(&mut self, n: usize, dims: usize) -> Vec<Vec<f64>> {
        use rand::Rng;
        (0..n)
            .map(|_| (0..dims).map(|_| self.gen::<f64>()).collect())
            .collect()
    }
}
