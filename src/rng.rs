//! A thin-but-stable wrapper over `rand::rngs::SmallRng` that provides a few
//! more conveniences for our use-cases.

use rand::{rngs::SmallRng, Rng as _, SeedableRng};

/// A pseudorandom number generator.
///
/// Not cryptographically secure.
///
/// Every havoc stage gets its own `Rng`, seeded from its generator's master
/// `Rng`, so that a generator built with a fixed seed produces the same
/// candidates for the same queue contents.
#[derive(Clone, Debug)]
pub struct Rng {
    inner: SmallRng,
}

impl Default for Rng {
    fn default() -> Self {
        Self::from_entropy()
    }
}

macro_rules! gen_methods {
    ( $( $name:ident -> $ty:ty ; )* ) => {
        $(
            /// Generate a random
            #[doc = concat!("`", stringify!($ty), "`")]
            /// value.
            pub fn $name(&mut self) -> $ty {
                self.inner.gen()
            }
        )*
    };
}

impl Rng {
    /// Create a new `Rng` deterministically seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            inner: SmallRng::seed_from_u64(seed),
        }
    }

    /// Create a new `Rng` seeded from operating system entropy.
    pub fn from_entropy() -> Self {
        Self {
            inner: SmallRng::from_entropy(),
        }
    }

    /// Split off a new, independently seeded `Rng`.
    pub fn fork(&mut self) -> Self {
        Self::new(self.gen_u64())
    }

    /// Generate a random `usize` in the range `0..len`.
    ///
    /// If `len` is `0`, then `None` is returned.
    #[inline]
    pub fn gen_index(&mut self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }

        // https://lemire.me/blog/2016/06/30/fast-random-shuffling/
        if let Ok(len32) = u32::try_from(len) {
            let random32bit = u64::from(self.gen_u32());
            let multiresult = random32bit.wrapping_mul(u64::from(len32));
            Some((multiresult >> 32) as usize)
        } else {
            Some(self.inner.gen_range(0..len))
        }
    }

    /// Generate a random `usize` in the range `0..len`, or `0` when `len` is
    /// `0`.
    #[inline]
    pub fn below(&mut self, len: usize) -> usize {
        self.gen_index(len).unwrap_or(0)
    }

    /// Returns `true` with probability `1 / n`.
    #[inline]
    pub fn one_in(&mut self, n: usize) -> bool {
        self.below(n) == 0
    }

    /// Choose a random element from a slice.
    ///
    /// If the slice is empty, then `None` is returned.
    #[inline]
    pub fn choose<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        let idx = self.gen_index(items.len())?;
        items.get(idx)
    }

    gen_methods! {
        gen_bool -> bool;
        gen_u8 -> u8;
        gen_u32 -> u32;
        gen_u64 -> u64;
    }
}
