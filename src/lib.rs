#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod _guide;
pub mod bytes;
pub mod cache;
pub mod coverage;
pub mod dictionary;
pub mod error;
pub mod fuzzer;
pub mod generator;
pub mod invoke;
pub mod mutators;
pub mod param;
#[cfg(feature = "persist")]
pub mod persist;
pub mod provider;
pub mod queue;
mod rng;
pub mod tracer;

use std::sync::{Mutex, MutexGuard};

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use fuzzer::Fuzzer;
pub use generator::{ByteArrayConfig, ByteArrayGenerator};
pub use mutators::{Limits, MutationConfig};
pub use param::{Param, ParamGen, Value, ValueKind};
pub use rng::Rng;

/// The context for the current havoc tweak.
///
/// This context carries the size limits a tweak must respect, the block-size
/// tier range chosen by the owning generator, and a random number generator.
///
/// Every candidate tweak, which is a closure that will perform its associated
/// changes when invoked, is given a context.
#[derive(Debug)]
pub struct Context {
    rng: Rng,
    limits: Limits,
    block_tiers: usize,
}

impl Context {
    /// Create a new context with the given random number generator and limits.
    ///
    /// Block-length selection starts out restricted to the smallest tier; see
    /// [`Context::set_block_tiers`].
    pub fn new(rng: Rng, limits: Limits) -> Self {
        Self {
            rng,
            limits,
            block_tiers: 1,
        }
    }

    /// Get this context's random number generator.
    #[inline]
    #[must_use]
    pub fn rng(&mut self) -> &mut Rng {
        &mut self.rng
    }

    /// The size limits tweaks must respect.
    #[inline]
    #[must_use]
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Set how many block-size tiers [`Context::choose_block_len`] may pick
    /// from. Values are clamped to at least one.
    #[inline]
    pub fn set_block_tiers(&mut self, tiers: usize) {
        self.block_tiers = tiers.max(1);
    }

    /// Choose the length of a block to delete, clone, insert, or overwrite.
    ///
    /// A size tier is picked uniformly from the current tier range: tier 0
    /// spans `1..=small`, tier 1 spans `small..=medium`, and any higher tier
    /// spans `medium..=large` nine times in ten and `large..=xlarge` otherwise.
    /// The result is never more than `limit` and never less than one.
    pub fn choose_block_len(&mut self, limit: usize) -> usize {
        let limit = limit.max(1);
        let l = self.limits;
        let (mut min, max) = match self.rng.below(self.block_tiers) {
            0 => (1, l.block_small),
            1 => (l.block_small, l.block_medium),
            _ if self.rng.one_in(10) => (l.block_large, l.block_xlarge),
            _ => (l.block_medium, l.block_large),
        };
        if min >= limit {
            min = 1;
        }
        let max = max.min(limit).max(min);
        min + self.rng.below(max - min + 1)
    }

    /// Apply one randomly chosen candidate tweak from `mutator` to `value`.
    ///
    /// Returns an [`Exhausted`][ErrorKind::Exhausted] error when no tweak
    /// applies to `value`.
    pub fn mutate_with<T>(&mut self, mutator: &mut impl Mutate<T>, value: &mut T) -> Result<()>
    where
        T: ?Sized,
    {
        log::trace!("=== choosing and applying a tweak ===");

        // Count how many tweaks we *could* perform.
        let mut candidates = Candidates {
            context: self,
            phase: Phase::Count(0),
            applied_mutation: false,
        };
        mutator.mutate(&mut candidates, value)?;

        let count = match candidates.phase {
            Phase::Count(count) => count,
            Phase::Mutate { .. } => unreachable!(),
        };
        log::trace!("counted {count} tweaks");

        let Some(target) = candidates.context.rng().gen_index(count as usize) else {
            log::trace!("no tweak applies");
            return Err(Error::exhausted());
        };
        log::trace!("targeting tweak {target}");

        // Perform the chosen target tweak.
        candidates.phase = Phase::Mutate {
            current: 0,
            target: target as u32,
        };
        match mutator.mutate(&mut candidates, value) {
            Err(e) if e.is_early_exit() => Ok(()),
            Err(e) => {
                log::error!("failed to apply tweak: {e}");
                Err(e)
            }
            Ok(()) if candidates.applied_mutation => panic!(
                "a tweak was applied but its early-exit error was not propagated; \
                 a `?` is missing after a `Candidates::mutation` call"
            ),
            Ok(()) => panic!(
                "nondeterministic tweak enumeration: counted {count} tweaks in the \
                 first pass but found fewer in the second"
            ),
        }
    }
}

#[derive(Clone, Copy)]
enum Phase {
    Count(u32),
    Mutate { current: u32, target: u32 },
}

/// The set of tweaks that can be applied to a value.
///
/// Passed to [`Mutate::mutate`] so that implementations can register every
/// tweak they could perform on the value they were given.
pub struct Candidates<'a> {
    context: &'a mut Context,
    phase: Phase,
    applied_mutation: bool,
}

impl<'a> Candidates<'a> {
    /// Register a candidate tweak.
    ///
    /// `f` performs the tweak on the value that was passed to
    /// [`Mutate::mutate`]. It is only invoked for the one candidate that was
    /// chosen; its result must be `?`-propagated.
    #[inline]
    pub fn mutation(&mut self, mut f: impl FnMut(&mut Context) -> Result<()>) -> Result<()> {
        match &mut self.phase {
            Phase::Count(count) => {
                *count += 1;
                Ok(())
            }
            Phase::Mutate { current, target } => {
                assert!(
                    *current <= *target,
                    "{current} <= {target}; did you forget to `?`-propagate the \
                     result of a `Candidates::mutation` call?",
                );
                if *current == *target {
                    self.applied_mutation = true;
                    f(self.context)?;
                    Err(Error::early_exit())
                } else {
                    *current += 1;
                    Ok(())
                }
            }
        }
    }

    /// The limits of the context the chosen tweak will run in.
    #[inline]
    pub fn limits(&self) -> &Limits {
        self.context.limits()
    }
}

/// A randomized, in-place tweak of a value.
///
/// Implementations register every tweak they *could* perform via
/// [`Candidates::mutation`]; one of them is then chosen uniformly at random and
/// applied. Registering the same kind of tweak more than once biases the
/// choice towards it.
///
/// `mutate` is called twice for every applied tweak, once to count and once to
/// apply, so it must be deterministic for a given value and must only modify
/// `value` from inside a registered closure.
pub trait Mutate<T>
where
    T: ?Sized,
{
    /// Register the candidate tweaks for `value`.
    fn mutate(&mut self, mutations: &mut Candidates<'_>, value: &mut T) -> Result<()>;
}

impl<M, T> Mutate<T> for &mut M
where
    M: Mutate<T>,
    T: ?Sized,
{
    fn mutate(&mut self, c: &mut Candidates<'_>, value: &mut T) -> Result<()> {
        (**self).mutate(c, value)
    }
}

/// Lock `mutex`, recovering the data if another thread panicked while holding
/// it. None of the guarded state in this crate can be left half-updated by a
/// panic.
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
