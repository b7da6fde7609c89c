use rand::Rng;
use rand::seq::index;

/// Number of leading bytes left untouched, typically container or format markers.
pub const DEFAULT_RESERVED_PREFIX: usize = 4;

/// Fraction of the mutable bytes that get one bit flipped per mutation.
pub const DEFAULT_FLIP_RATIO: f64 = 0.01;

/// A `Mutator` derives a new test case from a seed without modifying the seed.
///
/// Mutators are stateless; all randomness comes from the caller's RNG, so a
/// seeded RNG reproduces the same sequence of test cases.
pub trait Mutator {
    /// Produces one mutated copy of `seed`.
    ///
    /// # Arguments
    /// * `seed`: the baseline input. It is only read.
    /// * `rng`: source of randomness for choosing positions and bits.
    ///
    /// # Returns
    /// A freshly allocated buffer of the same length as `seed`.
    fn mutate<R: Rng + ?Sized>(&self, seed: &[u8], rng: &mut R) -> Vec<u8>;
}

/// Flips one random bit in each of a fixed share of distinct byte positions.
///
/// For a seed of length `L`, `floor((L - reserved_prefix) * flip_ratio)`
/// distinct offsets in `[reserved_prefix, L)` are picked without replacement.
/// Seeds not longer than the prefix come back unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BitFlipMutator {
    /// Leading bytes never touched.
    reserved_prefix: usize,
    /// Share of the remaining bytes that get a bit flipped, in `[0, 1]`.
    flip_ratio: f64,
}

impl Default for BitFlipMutator {
    fn default() -> Self {
        Self {
            reserved_prefix: DEFAULT_RESERVED_PREFIX,
            flip_ratio: DEFAULT_FLIP_RATIO,
        }
    }
}

impl BitFlipMutator {
    pub fn new(reserved_prefix: usize, flip_ratio: f64) -> Self {
        Self {
            reserved_prefix,
            flip_ratio: flip_ratio.clamp(0.0, 1.0),
        }
    }

    /// Number of bytes altered in a seed of `seed_len` bytes.
    pub fn flip_count(&self, seed_len: usize) -> usize {
        let mutable = seed_len.saturating_sub(self.reserved_prefix);
        ((mutable as f64) * self.flip_ratio).floor() as usize
    }
}

impl Mutator for BitFlipMutator {
    fn mutate<R: Rng + ?Sized>(&self, seed: &[u8], rng: &mut R) -> Vec<u8> {
        let mut mutated = seed.to_vec();
        let flips = self.flip_count(seed.len());
        if flips == 0 {
            return mutated;
        }

        let mutable = seed.len() - self.reserved_prefix;
        for offset in index::sample(rng, mutable, flips).iter() {
            let bit = rng.random_range(0..8u32);
            mutated[self.reserved_prefix + offset] ^= 1u8 << bit;
        }
        mutated
    }
}
