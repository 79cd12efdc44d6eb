//! Endian-aware integer access and bit-flip helpers over byte buffers.
//!
//! Bits are addressed globally across a buffer: bit `i` is bit `i % 8`
//! (least significant first) of byte `i / 8`.
//!
//! The `could_*` predicates let the arithmetic and interesting-value stages
//! skip candidates that a cheaper flip stage already produced. They only
//! affect efficiency, never which inputs are reachable.

/// Read a little-endian `u16` at `at`.
///
/// # Panics
///
/// Panics if `at + 2 > buf.len()`.
#[inline]
pub fn get_u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Read a big-endian `u16` at `at`.
#[inline]
pub fn get_u16_be(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Write a little-endian `u16` at `at`.
#[inline]
pub fn put_u16_le(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Write a big-endian `u16` at `at`.
#[inline]
pub fn put_u16_be(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

/// Read a little-endian `u32` at `at`.
///
/// # Panics
///
/// Panics if `at + 4 > buf.len()`.
#[inline]
pub fn get_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Read a big-endian `u32` at `at`.
#[inline]
pub fn get_u32_be(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Write a little-endian `u32` at `at`.
#[inline]
pub fn put_u32_le(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a big-endian `u32` at `at`.
#[inline]
pub fn put_u32_be(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

/// Return `byte` with bit `bit` (0 is least significant) flipped.
#[inline]
pub fn flip_bit(byte: u8, bit: u32) -> u8 {
    byte ^ (1 << (bit % 8))
}

/// Flip the bit at global bit index `bit` within `buf`.
///
/// # Panics
///
/// Panics if `bit >= buf.len() * 8`.
#[inline]
pub fn flip_bit_at(buf: &mut [u8], bit: usize) {
    buf[bit / 8] ^= 1 << (bit % 8);
}

/// Return the bitwise NOT of `byte`.
#[inline]
pub fn invert_byte(byte: u8) -> u8 {
    !byte
}

/// Remove `len` bytes starting at `from`, shifting the tail down.
#[inline]
pub fn remove_block(buf: &mut Vec<u8>, from: usize, len: usize) {
    buf.drain(from..from + len);
}

/// Widest contiguous run of bits the flip predicates consider.
const MAX_FLIP_WINDOW: usize = 4;

/// Whether `new` equals `orig` or can be produced from it by flipping a
/// contiguous run of 1 to 4 bits, using global bit addressing.
///
/// Slices of different length never match.
///
/// ```
/// use covfuzz::bytes::could_bit_flip;
///
/// assert!(could_bit_flip(&[0b0000_0000], &[0b0000_0110]));
/// assert!(could_bit_flip(&[0x00, 0x00], &[0x80, 0x01]));
/// assert!(!could_bit_flip(&[0b0000_0000], &[0b0000_0101]));
/// ```
pub fn could_bit_flip(orig: &[u8], new: &[u8]) -> bool {
    if orig.len() != new.len() {
        return false;
    }
    if orig == new {
        return true;
    }

    let bits = orig.len() * 8;
    let mut scratch = orig.to_vec();
    for width in 1..=MAX_FLIP_WINDOW {
        if width > bits {
            break;
        }
        for start in 0..=bits - width {
            for bit in start..start + width {
                flip_bit_at(&mut scratch, bit);
            }
            let hit = scratch == new;
            for bit in start..start + width {
                flip_bit_at(&mut scratch, bit);
            }
            if hit {
                return true;
            }
        }
    }
    false
}

/// Whether `new` can be produced from `orig` by inverting 1, 2, or 4
/// consecutive bytes.
///
/// ```
/// use covfuzz::bytes::could_byte_flip;
///
/// assert!(could_byte_flip(&[0x00, 0x12, 0x00], &[0x00, 0xed, 0x00]));
/// assert!(!could_byte_flip(&[0x00, 0x12, 0x00], &[0xff, 0xed, 0xff]));
/// ```
pub fn could_byte_flip(orig: &[u8], new: &[u8]) -> bool {
    if orig.len() != new.len() {
        return false;
    }
    let Some((lo, hi)) = diff_range(orig, new) else {
        return false;
    };
    matches!(hi - lo, 1 | 2 | 4) && (lo..hi).all(|i| orig[i] ^ new[i] == 0xff)
}

/// The smallest `lo..hi` range outside of which `a` and `b` agree, or `None`
/// if they are equal. Both slices must be the same length.
pub(crate) fn diff_range(a: &[u8], b: &[u8]) -> Option<(usize, usize)> {
    debug_assert_eq!(a.len(), b.len());
    let lo = a.iter().zip(b).position(|(x, y)| x != y)?;
    let hi = a.len() - a.iter().rev().zip(b.iter().rev()).position(|(x, y)| x != y)?;
    Some((lo, hi))
}

/// Fixed-width integers that can be checked for bit-flip reachability.
///
/// Values are compared through their little-endian byte representation, so a
/// flip window may straddle byte boundaries.
pub trait BitFlip: Copy {
    /// Whether any of `candidates` equals `self`, or can be produced from
    /// `self` by flipping a contiguous run of 1 to 4 bits.
    ///
    /// ```
    /// use covfuzz::bytes::BitFlip;
    ///
    /// assert!(7u8.could_have_bit_flipped_to(&[7]));
    /// assert!(0u16.could_have_bit_flipped_to(&[0x0180]));
    /// assert!(!0u32.could_have_bit_flipped_to(&[0x0101, 0xffff]));
    /// ```
    fn could_have_bit_flipped_to(self, candidates: &[Self]) -> bool;
}

macro_rules! bit_flip_impls {
    ( $( $ty:ty ),* ) => {
        $(
            impl BitFlip for $ty {
                fn could_have_bit_flipped_to(self, candidates: &[Self]) -> bool {
                    let orig = self.to_le_bytes();
                    candidates
                        .iter()
                        .any(|c| could_bit_flip(&orig, &c.to_le_bytes()))
                }
            }
        )*
    };
}

bit_flip_impls!(u8, u16, u32);
