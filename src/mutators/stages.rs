//! The deterministic mutation stages.
//!
//! Every stage is a lazy, finite iterator over an immutable seed. Each yielded
//! candidate is a fresh buffer; the seed is never modified and never aliased.
//! No stage yields a candidate equal to its seed.
//!
//! The arithmetic and interesting-value stages skip candidates that a cheaper
//! stage run over the same seed already yields, so for a given seed the
//! interesting stages do not overlap the arithmetic or flip stages, and the
//! arithmetic stages do not overlap the flip stages or each other.

use super::{Limits, INTERESTING_16, INTERESTING_32, INTERESTING_8};
use crate::bytes::{could_bit_flip, could_byte_flip, diff_range, flip_bit_at, invert_byte};
use std::sync::Arc;

/// The integer width an arithmetic or interesting-value stage operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Width {
    /// One byte.
    W8,
    /// Two bytes, both endiannesses.
    W16,
    /// Four bytes, both endiannesses.
    W32,
}

impl Width {
    /// The number of bytes in this width.
    #[inline]
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    #[inline]
    fn endians(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 | Width::W32 => 2,
        }
    }
}

fn read(span: &[u8], big_endian: bool) -> u64 {
    let fold = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
    if big_endian {
        span.iter().fold(0, fold)
    } else {
        span.iter().rev().fold(0, fold)
    }
}

fn write(span: &mut [u8], big_endian: bool, mut value: u64) {
    let len = span.len();
    for i in 0..len {
        let at = if big_endian { len - 1 - i } else { i };
        span[at] = value as u8;
        value >>= 8;
    }
}

/// Whether some arithmetic stage over `seed` could produce `candidate`: a
/// single 1, 2, or 4 byte window, read in either endianness, whose wrapping
/// difference is within `arith_max`.
fn could_be_arith(seed: &[u8], candidate: &[u8], arith_max: u32) -> bool {
    let Some((lo, hi)) = diff_range(seed, candidate) else {
        return false;
    };
    let max = u64::from(arith_max);
    [1usize, 2, 4].into_iter().any(|w| {
        if hi - lo > w || w > seed.len() {
            return false;
        }
        let modulus = 1u64 << (8 * w);
        let first = hi.saturating_sub(w);
        let last = lo.min(seed.len() - w);
        (first..=last).any(|o| {
            [false, true].into_iter().any(|be| {
                let orig = read(&seed[o..o + w], be);
                let new = read(&candidate[o..o + w], be);
                let d = new.wrapping_sub(orig) & (modulus - 1);
                d <= max || modulus - d <= max
            })
        })
    })
}

/// Whether an interesting-value stage of a width narrower than `width` could
/// produce `candidate` from `seed`.
fn could_be_narrower_interesting(seed: &[u8], candidate: &[u8], width: Width) -> bool {
    let Some((lo, hi)) = diff_range(seed, candidate) else {
        return false;
    };
    if width == Width::W8 {
        return false;
    }
    if hi - lo == 1 && INTERESTING_8.contains(&(candidate[lo] as i8)) {
        return true;
    }
    if width == Width::W32 && hi - lo <= 2 && seed.len() >= 2 {
        let first = hi.saturating_sub(2);
        let last = lo.min(seed.len() - 2);
        return (first..=last).any(|o| {
            [false, true].into_iter().any(|be| {
                let v = read(&candidate[o..o + 2], be) as u16 as i16;
                INTERESTING_16.contains(&v)
            })
        });
    }
    false
}

fn is_flip(seed_span: &[u8], new_span: &[u8]) -> bool {
    could_bit_flip(seed_span, new_span) || could_byte_flip(seed_span, new_span)
}

/// Slide a window of `n` contiguous bits over the seed, flipping them.
///
/// See [`flip_bits`].
#[derive(Clone, Debug)]
pub struct FlipBits {
    seed: Arc<[u8]>,
    n: usize,
    next: usize,
}

/// Yield one candidate per position of an `n`-bit window over the seed, with
/// the bits under the window flipped: `seed.len() * 8 - n + 1` candidates in
/// total, or none if the seed is shorter than `n` bits.
///
/// # Example
///
/// ```
/// use covfuzz::mutators as m;
///
/// let candidates: Vec<_> = m::flip_bits(vec![0u8], 4).collect();
/// assert_eq!(candidates, [[0x0f], [0x1e], [0x3c], [0x78], [0xf0]]);
/// ```
pub fn flip_bits(seed: impl Into<Arc<[u8]>>, n: usize) -> FlipBits {
    FlipBits {
        seed: seed.into(),
        n: n.max(1),
        next: 0,
    }
}

impl FlipBits {
    fn total(&self) -> usize {
        (self.seed.len() * 8 + 1).saturating_sub(self.n)
    }
}

impl Iterator for FlipBits {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.next >= self.total() {
            return None;
        }
        let mut out = self.seed.to_vec();
        for bit in self.next..self.next + self.n {
            flip_bit_at(&mut out, bit);
        }
        self.next += 1;
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for FlipBits {}

/// Slide a window of `n` contiguous bytes over the seed, inverting them.
///
/// See [`flip_bytes`].
#[derive(Clone, Debug)]
pub struct FlipBytes {
    seed: Arc<[u8]>,
    n: usize,
    next: usize,
}

/// Yield one candidate per position of an `n`-byte window over the seed, with
/// the bytes under the window inverted.
///
/// # Example
///
/// ```
/// use covfuzz::mutators as m;
///
/// let candidates: Vec<_> = m::flip_bytes(vec![0u8; 3], 2).collect();
/// assert_eq!(candidates, [[0xff, 0xff, 0x00], [0x00, 0xff, 0xff]]);
/// ```
pub fn flip_bytes(seed: impl Into<Arc<[u8]>>, n: usize) -> FlipBytes {
    FlipBytes {
        seed: seed.into(),
        n: n.max(1),
        next: 0,
    }
}

impl FlipBytes {
    fn total(&self) -> usize {
        (self.seed.len() + 1).saturating_sub(self.n)
    }
}

impl Iterator for FlipBytes {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.next >= self.total() {
            return None;
        }
        let mut out = self.seed.to_vec();
        for b in &mut out[self.next..self.next + self.n] {
            *b = invert_byte(*b);
        }
        self.next += 1;
        Some(out)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for FlipBytes {}

/// Add and subtract small deltas to the integer at every offset.
///
/// See [`arith`].
#[derive(Clone, Debug)]
pub struct Arith {
    seed: Arc<[u8]>,
    scratch: Vec<u8>,
    width: Width,
    arith_max: u32,
    offset: usize,
    step: usize,
    le_span: Option<u64>,
}

/// Yield, for every offset, the seed with `+1, -1, +2, -2, ..., +arith_max,
/// -arith_max` added (wrapping) to the `width` integer there, in both
/// endiannesses for 16 and 32 bits.
///
/// Candidates reachable by the flip stages are skipped. A 16-bit candidate
/// must change both of its bytes and a 32-bit candidate more than two,
/// otherwise a narrower arithmetic stage already covers it.
///
/// # Example
///
/// ```
/// use covfuzz::mutators::{self as m, Limits, Width};
///
/// let limits = Limits { arith_max: 3, ..Limits::default() };
/// let candidates: Vec<_> = m::arith(vec![0x00u8], Width::W8, &limits).collect();
///
/// // `+1`, `+2`, `+3` and `-1` are all reachable by flipping bits or bytes.
/// assert_eq!(candidates, [[0xfe], [0xfd]]);
/// ```
pub fn arith(seed: impl Into<Arc<[u8]>>, width: Width, limits: &Limits) -> Arith {
    let seed = seed.into();
    Arith {
        scratch: seed.to_vec(),
        seed,
        width,
        arith_max: limits.arith_max,
        offset: 0,
        step: 0,
        le_span: None,
    }
}

impl Arith {
    fn steps_per_offset(&self) -> usize {
        2 * self.arith_max as usize * self.width.endians()
    }

    fn accept(&self, at: usize) -> bool {
        let w = self.width.bytes();
        let orig = &self.seed[at..at + w];
        let new = &self.scratch[at..at + w];
        let changed = orig.iter().zip(new).filter(|(a, b)| a != b).count();
        let wide_enough = match self.width {
            Width::W8 => changed == 1,
            Width::W16 => changed == 2,
            Width::W32 => changed > 2,
        };
        wide_enough && !is_flip(orig, new)
    }
}

impl Iterator for Arith {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let w = self.width.bytes();
        let per_offset = self.steps_per_offset();
        let endians = self.width.endians();
        let modulus = 1u64 << (8 * w);
        while per_offset > 0 && self.offset + w <= self.seed.len() {
            let at = self.offset;
            let step = self.step;
            self.step += 1;
            if self.step == per_offset {
                self.step = 0;
                self.offset += 1;
            }

            let k = step / endians;
            let big_endian = step % endians == 1;
            let magnitude = (k / 2 + 1) as u64;
            let delta = if k % 2 == 0 {
                magnitude
            } else {
                modulus - magnitude
            };

            let orig = read(&self.seed[at..at + w], big_endian);
            let new = orig.wrapping_add(delta) & (modulus - 1);
            write(&mut self.scratch[at..at + w], big_endian, new);
            let span = read(&self.scratch[at..at + w], false);

            let duplicate = big_endian && self.le_span == Some(span);
            if !big_endian {
                self.le_span = Some(span);
            }
            let keep = !duplicate && self.accept(at);
            let out = keep.then(|| self.scratch.clone());
            self.scratch[at..at + w].copy_from_slice(&self.seed[at..at + w]);
            if out.is_some() {
                return out;
            }
        }
        None
    }
}

/// Substitute interesting constants at every offset.
///
/// See [`interesting`].
#[derive(Clone, Debug)]
pub struct Interesting {
    seed: Arc<[u8]>,
    scratch: Vec<u8>,
    width: Width,
    arith_max: u32,
    offset: usize,
    step: usize,
}

/// Yield, for every offset, the seed with each interesting constant of
/// `width` written there, in both endiannesses for 16 and 32 bits.
///
/// Candidates equal to the seed, reachable by a flip stage, reachable by an
/// arithmetic stage, or reachable by substituting a narrower interesting
/// value are skipped.
///
/// # Example
///
/// ```
/// use covfuzz::mutators::{self as m, Limits, Width};
///
/// let candidates: Vec<_> = m::interesting(vec![0x50u8], Width::W8, &Limits::default())
///     .collect();
///
/// // `0x80` (-128) is neither a flip nor within 35 of `0x50`.
/// assert!(candidates.contains(&vec![0x80]));
/// // `0x64` (100) is `0x50 + 20`, which the arithmetic stage yields.
/// assert!(!candidates.contains(&vec![0x64]));
/// ```
pub fn interesting(seed: impl Into<Arc<[u8]>>, width: Width, limits: &Limits) -> Interesting {
    let seed = seed.into();
    Interesting {
        scratch: seed.to_vec(),
        seed,
        width,
        arith_max: limits.arith_max,
        offset: 0,
        step: 0,
    }
}

impl Interesting {
    fn table_len(&self) -> usize {
        match self.width {
            Width::W8 => INTERESTING_8.len(),
            Width::W16 => INTERESTING_16.len(),
            Width::W32 => INTERESTING_32.len(),
        }
    }

    fn value(&self, index: usize) -> u64 {
        match self.width {
            Width::W8 => u64::from(INTERESTING_8[index] as u8),
            Width::W16 => u64::from(INTERESTING_16[index] as u16),
            Width::W32 => u64::from(INTERESTING_32[index] as u32),
        }
    }

    fn accept(&self, at: usize) -> bool {
        let w = self.width.bytes();
        let orig = &self.seed[at..at + w];
        let new = &self.scratch[at..at + w];
        orig != new
            && !is_flip(orig, new)
            && !could_be_arith(&self.seed, &self.scratch, self.arith_max)
            && !could_be_narrower_interesting(&self.seed, &self.scratch, self.width)
    }
}

impl Iterator for Interesting {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let w = self.width.bytes();
        let endians = self.width.endians();
        let per_offset = self.table_len() * endians;
        while self.offset + w <= self.seed.len() {
            let at = self.offset;
            let step = self.step;
            self.step += 1;
            if self.step == per_offset {
                self.step = 0;
                self.offset += 1;
            }

            let value = self.value(step / endians);
            let big_endian = step % endians == 1;
            let le = value.to_le_bytes();
            if big_endian && read(&le[..w], true) == value {
                // Byte-symmetric constant: identical to the little-endian write.
                continue;
            }
            write(&mut self.scratch[at..at + w], big_endian, value);
            let out = self.accept(at).then(|| self.scratch.clone());
            self.scratch[at..at + w].copy_from_slice(&self.seed[at..at + w]);
            if out.is_some() {
                return out;
            }
        }
        None
    }
}

/// Overwrite the seed with dictionary tokens at every offset.
///
/// See [`dictionary`].
#[derive(Clone, Debug)]
pub struct Dictionary {
    seed: Arc<[u8]>,
    tokens: Arc<[Vec<u8>]>,
    offset: usize,
    token: usize,
}

/// Yield, for every offset, the seed overwritten there with each token that
/// fits before the end of the buffer.
///
/// All tokens are tried at an offset before moving to the next offset, in the
/// order given. Callers that want the shortest tokens first should sort them;
/// the byte-array generator does. Tokens that match the bytes already present
/// are skipped.
///
/// # Example
///
/// ```
/// use covfuzz::mutators as m;
/// use std::sync::Arc;
///
/// let tokens: Arc<[Vec<u8>]> = vec![b"z".to_vec(), b"xy".to_vec()].into();
/// let candidates: Vec<_> = m::dictionary(b"abc".to_vec(), tokens).collect();
/// assert_eq!(
///     candidates,
///     [b"zbc".to_vec(), b"xyc".to_vec(), b"azc".to_vec(), b"axy".to_vec(), b"abz".to_vec()],
/// );
/// ```
pub fn dictionary(seed: impl Into<Arc<[u8]>>, tokens: Arc<[Vec<u8>]>) -> Dictionary {
    Dictionary {
        seed: seed.into(),
        tokens,
        offset: 0,
        token: 0,
    }
}

impl Iterator for Dictionary {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.tokens.is_empty() {
            return None;
        }
        while self.offset < self.seed.len() {
            let at = self.offset;
            let token = &self.tokens[self.token];
            self.token += 1;
            if self.token == self.tokens.len() {
                self.token = 0;
                self.offset += 1;
            }

            let end = at + token.len();
            if token.is_empty() || end > self.seed.len() || self.seed[at..end] == token[..] {
                continue;
            }
            let mut out = self.seed.to_vec();
            out[at..end].copy_from_slice(token);
            return Some(out);
        }
        None
    }
}
