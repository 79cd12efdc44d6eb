//! Byte-buffer mutation: the deterministic stages and randomized havoc.
//!
//! It is idiomatic to import this module with the alias `m`:
//!
//! ```rust
//! use covfuzz::mutators as m;
//! ```

pub mod havoc;
pub mod stages;

pub use havoc::{havoc, Havoc, Tweak, Tweaks};
pub use stages::{
    arith, dictionary, flip_bits, flip_bytes, interesting, Arith, Dictionary, FlipBits,
    FlipBytes, Interesting, Width,
};

/// Interesting 8-bit values: sign and magnitude boundaries.
pub const INTERESTING_8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

/// Interesting 16-bit values, in addition to [`INTERESTING_8`].
pub const INTERESTING_16: [i16; 10] = [-32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767];

/// Interesting 32-bit values, in addition to [`INTERESTING_16`].
pub const INTERESTING_32: [i32; 8] = [
    i32::MIN,
    -100_663_046,
    -32769,
    32768,
    65535,
    65536,
    100_663_045,
    i32::MAX,
];

/// Size limits shared by the deterministic stages and havoc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Largest delta the arithmetic stages and tweaks add or subtract.
    pub arith_max: u32,
    /// Upper bound of the smallest block-size tier.
    pub block_small: usize,
    /// Upper bound of the second block-size tier.
    pub block_medium: usize,
    /// Upper bound of the common large block-size tier.
    pub block_large: usize,
    /// Upper bound of the rare extra-large block-size tier.
    pub block_xlarge: usize,
    /// Havoc never grows an input beyond this many bytes.
    pub max_input: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            arith_max: 35,
            block_small: 32,
            block_medium: 128,
            block_large: 1500,
            block_xlarge: 32768,
            max_input: 1024 * 1024,
        }
    }
}

/// Configuration for the mutation pipeline of a byte-array generator.
///
/// # Example
///
/// ```
/// use covfuzz::{mutators::Tweak, MutationConfig};
///
/// let config = MutationConfig::default()
///     .havoc_cycles(256)
///     .tweaks(vec![Tweak::FlipSingleBit, Tweak::RandomByte]);
/// assert_eq!(config.limits.arith_max, 35);
/// ```
#[derive(Clone, Debug)]
pub struct MutationConfig {
    /// Size limits.
    pub limits: Limits,
    /// Number of candidates each havoc stage produces.
    pub havoc_cycles: usize,
    /// Each havoc candidate stacks `2^(1 + r)` tweaks where `r` is uniform in
    /// `0..=havoc_stack_power`.
    pub havoc_stack_power: u32,
    /// The havoc tweak list. Chosen from uniformly, so duplicates bias the
    /// distribution.
    pub tweaks: Vec<Tweak>,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            havoc_cycles: 1024,
            havoc_stack_power: 7,
            tweaks: Tweak::suggested(),
        }
    }
}

impl MutationConfig {
    /// Set the size limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the number of havoc candidates per stage.
    pub fn havoc_cycles(mut self, cycles: usize) -> Self {
        self.havoc_cycles = cycles;
        self
    }

    /// Set the havoc stacking power.
    pub fn havoc_stack_power(mut self, power: u32) -> Self {
        self.havoc_stack_power = power;
        self
    }

    /// Set the havoc tweak list.
    pub fn tweaks(mut self, tweaks: Vec<Tweak>) -> Self {
        self.tweaks = tweaks;
        self
    }
}
