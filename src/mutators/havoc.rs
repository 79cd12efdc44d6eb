//! Randomized, stacked havoc mutation.

use super::{Limits, MutationConfig, INTERESTING_16, INTERESTING_32, INTERESTING_8};
use crate::{bytes, Candidates, Context, Mutate, Result, Rng};
use std::sync::Arc;

/// A single havoc tweak.
///
/// Each tweak only registers itself as a candidate when it can apply to the
/// current buffer, so for example [`Tweak::InterestingInt`] is never chosen
/// for a buffer shorter than four bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tweak {
    /// Flip one random bit.
    FlipSingleBit,
    /// Write an interesting 8-bit value at a random offset.
    InterestingByte,
    /// Write an interesting 16-bit value at a random offset and endianness.
    InterestingShort,
    /// Write an interesting 32-bit value at a random offset and endianness.
    InterestingInt,
    /// Subtract `1..=arith_max` from a random byte.
    SubtractFromByte,
    /// Add `1..=arith_max` to a random byte.
    AddToByte,
    /// Subtract `1..=arith_max` from a random 16-bit value.
    SubtractFromShort,
    /// Add `1..=arith_max` to a random 16-bit value.
    AddToShort,
    /// Subtract `1..=arith_max` from a random 32-bit value.
    SubtractFromInt,
    /// Add `1..=arith_max` to a random 32-bit value.
    AddToInt,
    /// Replace a random byte with a different random byte.
    RandomByte,
    /// Delete a random block.
    DeleteBytes,
    /// Insert a copy of another block, or (one time in four) a block of
    /// repeated filler. Never grows the buffer beyond `max_input`.
    CloneOrInsertBytes,
    /// Overwrite a random block with a copy of another block, or (one time in
    /// four) with repeated filler.
    OverwriteBytes,
}

impl Tweak {
    /// The default tweak list. Deletion appears twice so that havoc does not
    /// steadily grow its inputs.
    pub fn suggested() -> Vec<Tweak> {
        vec![
            Tweak::FlipSingleBit,
            Tweak::InterestingByte,
            Tweak::InterestingShort,
            Tweak::InterestingInt,
            Tweak::SubtractFromByte,
            Tweak::AddToByte,
            Tweak::SubtractFromShort,
            Tweak::AddToShort,
            Tweak::SubtractFromInt,
            Tweak::AddToInt,
            Tweak::RandomByte,
            Tweak::DeleteBytes,
            Tweak::DeleteBytes,
            Tweak::CloneOrInsertBytes,
            Tweak::OverwriteBytes,
        ]
    }

    /// Whether this tweak can apply to a buffer of `len` bytes.
    pub fn applies_to(self, len: usize, limits: &Limits) -> bool {
        match self {
            Tweak::FlipSingleBit
            | Tweak::InterestingByte
            | Tweak::SubtractFromByte
            | Tweak::AddToByte
            | Tweak::RandomByte => len >= 1,
            Tweak::InterestingShort
            | Tweak::SubtractFromShort
            | Tweak::AddToShort
            | Tweak::DeleteBytes
            | Tweak::OverwriteBytes => len >= 2,
            Tweak::InterestingInt | Tweak::SubtractFromInt | Tweak::AddToInt => len >= 4,
            Tweak::CloneOrInsertBytes => len < limits.max_input,
        }
    }

    /// Apply this tweak to `buf`.
    ///
    /// Must only be called when [`Tweak::applies_to`] holds for `buf`.
    pub fn apply(self, ctx: &mut Context, buf: &mut Vec<u8>) {
        let arith_max = ctx.limits().arith_max as usize;
        match self {
            Tweak::FlipSingleBit => {
                let bit = ctx.rng().below(buf.len() * 8);
                bytes::flip_bit_at(buf, bit);
            }
            Tweak::InterestingByte => {
                let i = ctx.rng().below(buf.len());
                let v = ctx.rng().choose(&INTERESTING_8).copied().unwrap_or(0);
                buf[i] = v as u8;
            }
            Tweak::InterestingShort => {
                let v = ctx.rng().choose(&INTERESTING_16).copied().unwrap_or(0);
                update_u16(ctx, buf, |_| v as u16);
            }
            Tweak::InterestingInt => {
                let v = ctx.rng().choose(&INTERESTING_32).copied().unwrap_or(0);
                update_u32(ctx, buf, |_| v as u32);
            }
            Tweak::SubtractFromByte | Tweak::AddToByte => {
                let i = ctx.rng().below(buf.len());
                let d = (1 + ctx.rng().below(arith_max)) as u8;
                buf[i] = if self == Tweak::AddToByte {
                    buf[i].wrapping_add(d)
                } else {
                    buf[i].wrapping_sub(d)
                };
            }
            Tweak::SubtractFromShort | Tweak::AddToShort => {
                let d = (1 + ctx.rng().below(arith_max)) as u16;
                let add = self == Tweak::AddToShort;
                update_u16(ctx, buf, |v| {
                    if add {
                        v.wrapping_add(d)
                    } else {
                        v.wrapping_sub(d)
                    }
                });
            }
            Tweak::SubtractFromInt | Tweak::AddToInt => {
                let d = (1 + ctx.rng().below(arith_max)) as u32;
                let add = self == Tweak::AddToInt;
                update_u32(ctx, buf, |v| {
                    if add {
                        v.wrapping_add(d)
                    } else {
                        v.wrapping_sub(d)
                    }
                });
            }
            Tweak::RandomByte => {
                let i = ctx.rng().below(buf.len());
                buf[i] ^= (1 + ctx.rng().below(255)) as u8;
            }
            Tweak::DeleteBytes => {
                let len = ctx.choose_block_len(buf.len() - 1);
                let from = ctx.rng().below(buf.len() - len + 1);
                bytes::remove_block(buf, from, len);
            }
            Tweak::CloneOrInsertBytes => clone_or_insert(ctx, buf),
            Tweak::OverwriteBytes => {
                let len = ctx.choose_block_len(buf.len() - 1);
                let from = ctx.rng().below(buf.len() - len + 1);
                let to = ctx.rng().below(buf.len() - len + 1);
                if ctx.rng().below(4) > 0 {
                    buf.copy_within(from..from + len, to);
                } else {
                    let fill = filler(ctx, buf);
                    buf[to..to + len].fill(fill);
                }
            }
        }
    }
}

fn update_u16(ctx: &mut Context, buf: &mut [u8], f: impl FnOnce(u16) -> u16) {
    let at = ctx.rng().below(buf.len() - 1);
    if ctx.rng().gen_bool() {
        let v = f(bytes::get_u16_le(buf, at));
        bytes::put_u16_le(buf, at, v);
    } else {
        let v = f(bytes::get_u16_be(buf, at));
        bytes::put_u16_be(buf, at, v);
    }
}

fn update_u32(ctx: &mut Context, buf: &mut [u8], f: impl FnOnce(u32) -> u32) {
    let at = ctx.rng().below(buf.len() - 3);
    if ctx.rng().gen_bool() {
        let v = f(bytes::get_u32_le(buf, at));
        bytes::put_u32_le(buf, at, v);
    } else {
        let v = f(bytes::get_u32_be(buf, at));
        bytes::put_u32_be(buf, at, v);
    }
}

/// Either a random byte or a copy of one already in `buf`.
fn filler(ctx: &mut Context, buf: &[u8]) -> u8 {
    if buf.is_empty() || ctx.rng().gen_bool() {
        ctx.rng().gen_u8()
    } else {
        buf[ctx.rng().below(buf.len())]
    }
}

fn clone_or_insert(ctx: &mut Context, buf: &mut Vec<u8>) {
    let limits = *ctx.limits();
    let room = limits.max_input.saturating_sub(buf.len());
    let clone = !buf.is_empty() && ctx.rng().below(4) > 0;
    let to = ctx.rng().below(buf.len() + 1);
    let block: Vec<u8> = if clone {
        let len = ctx.choose_block_len(buf.len().min(room));
        let from = ctx.rng().below(buf.len() - len + 1);
        buf[from..from + len].to_vec()
    } else {
        let len = ctx.choose_block_len(limits.block_xlarge.min(room));
        vec![filler(ctx, buf); len]
    };
    buf.splice(to..to, block);
}

/// A [`Mutate`] implementation that chooses uniformly among the applicable
/// tweaks of a tweak list.
#[derive(Clone, Copy, Debug)]
pub struct Tweaks<'a>(pub &'a [Tweak]);

impl Mutate<Vec<u8>> for Tweaks<'_> {
    fn mutate(&mut self, c: &mut Candidates<'_>, value: &mut Vec<u8>) -> Result<()> {
        for &tweak in self.0 {
            if tweak.applies_to(value.len(), c.limits()) {
                c.mutation(|ctx| {
                    tweak.apply(ctx, value);
                    Ok(())
                })?;
            }
        }
        Ok(())
    }
}

/// The havoc stage over a seed.
///
/// See [`havoc`].
#[derive(Debug)]
pub struct Havoc {
    seed: Arc<[u8]>,
    tweaks: Arc<[Tweak]>,
    context: Context,
    stack_power: u32,
    cycles: usize,
    done: usize,
}

/// Yield up to `config.havoc_cycles` candidates, each a copy of the seed with
/// `2^(1 + r)` randomly chosen tweaks applied in sequence, where `r` is uniform
/// in `0..=config.havoc_stack_power`.
///
/// `block_tiers` bounds the block-size tiers available to the tweaks (see
/// [`Context::choose_block_len`]). Cycles whose stacked tweaks happen to
/// restore the seed yield nothing.
///
/// # Example
///
/// ```
/// use covfuzz::{mutators as m, MutationConfig, Rng};
///
/// let config = MutationConfig::default().havoc_cycles(16);
/// let seed = b"hello".to_vec();
/// for candidate in m::havoc(seed.clone(), &config, Rng::new(7), 1) {
///     assert_ne!(candidate, seed);
///     assert!(candidate.len() <= config.limits.max_input);
/// }
/// ```
pub fn havoc(
    seed: impl Into<Arc<[u8]>>,
    config: &MutationConfig,
    rng: Rng,
    block_tiers: usize,
) -> Havoc {
    let mut context = Context::new(rng, config.limits);
    context.set_block_tiers(block_tiers);
    Havoc {
        seed: seed.into(),
        tweaks: config.tweaks.clone().into(),
        context,
        stack_power: config.havoc_stack_power.min(30),
        cycles: config.havoc_cycles,
        done: 0,
    }
}

impl Iterator for Havoc {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        while self.done < self.cycles {
            self.done += 1;
            let mut buf = self.seed.to_vec();
            let power = 1 + self.context.rng().below(self.stack_power as usize + 1);
            let stack = 1usize << power;
            let mut tweaks = Tweaks(&self.tweaks);
            for _ in 0..stack {
                // Tweaks are infallible; the only error is that none applies.
                if self.context.mutate_with(&mut tweaks, &mut buf).is_err() {
                    break;
                }
            }
            if buf[..] != self.seed[..] {
                return Some(buf);
            }
        }
        None
    }
}
