//! Combining per-parameter generators into parameter tuples.

use crate::{error::CloseErrors, invoke::ExecutionResult, Param, ParamGen, Result, Rng};
use std::{collections::HashSet, fmt, sync::Arc};

/// A stream of parameter tuples.
pub type Tuples = Box<dyn Iterator<Item = Vec<Param>> + Send>;

/// Finite generators with at most this many values may be permuted
/// exhaustively by [`Strategy::Suggested`].
pub const MAX_PERMUTED_LEN: usize = 500;

/// At most this many generators are permuted exhaustively by
/// [`Strategy::Suggested`].
pub const MAX_PERMUTED_PARAMS: usize = 5;

/// [`Strategy::RandomSingleParamChange`] forgets the tuples it has seen once it
/// has seen this many.
pub const RANDOM_SEEN_RESET: usize = 20_000;

/// [`Strategy::RandomSingleParamChange`] stops after this many consecutive
/// changes that only reproduced tuples it had already seen.
pub const RANDOM_MAX_DUPES: usize = 200;

/// How a [`ParamProvider`] combines its generators' values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Every combination of values, with the last parameter varying fastest.
    AllPermutations,
    /// Advance every generator on every step, restarting exhausted ones, until
    /// each has run through all of its values at least once.
    EvenSingleParamChange,
    /// Change one randomly chosen parameter per step, until too many changes in
    /// a row only reproduce tuples seen before.
    RandomSingleParamChange {
        /// Seed for the choice of parameter, or `None` for entropy.
        seed: Option<u64>,
    },
    /// Mutational generators change evenly among themselves. Up to
    /// [`MAX_PERMUTED_PARAMS`] small finite generators are permuted
    /// exhaustively, and the rest change one at a time at random. Stops once
    /// both sides have completed at least once.
    Suggested {
        /// Seed for the random side, or `None` for entropy.
        seed: Option<u64>,
    },
}

/// Produces parameter tuples from one generator per target parameter, and
/// routes execution feedback back to those generators.
///
/// # Example
///
/// ```
/// use covfuzz::{param::Fixed, provider::{ParamProvider, Strategy}, ParamGen, Value};
/// use std::sync::Arc;
///
/// let gens: Vec<Arc<dyn ParamGen>> = vec![
///     Arc::new(Fixed::new(vec![Value::I32(1), Value::I32(2)])),
///     Arc::new(Fixed::new(vec![Value::Bool(true), Value::Bool(false)])),
/// ];
/// let provider = ParamProvider::new(gens, Strategy::AllPermutations);
///
/// let tuples: Vec<Vec<Value>> = provider
///     .iter()
///     .map(|t| t.iter().map(|p| p.value().clone()).collect())
///     .collect();
/// assert_eq!(tuples.len(), 4);
/// assert_eq!(tuples[1], [Value::I32(1), Value::Bool(false)]);
/// ```
#[derive(Clone)]
pub struct ParamProvider {
    gens: Vec<Arc<dyn ParamGen>>,
    strategy: Strategy,
}

impl fmt::Debug for ParamProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamProvider")
            .field("params", &self.gens.len())
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl ParamProvider {
    /// A provider over `gens` using `strategy`.
    pub fn new(gens: Vec<Arc<dyn ParamGen>>, strategy: Strategy) -> Self {
        Self { gens, strategy }
    }

    /// A provider over `gens` using [`Strategy::Suggested`] with a random
    /// seed.
    pub fn suggested(gens: Vec<Arc<dyn ParamGen>>) -> Self {
        Self::new(gens, Strategy::Suggested { seed: None })
    }

    /// The generators, one per parameter.
    pub fn generators(&self) -> &[Arc<dyn ParamGen>] {
        &self.gens
    }

    /// The combination strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// A fresh stream of tuples.
    pub fn iter(&self) -> Tuples {
        let gens = self.gens.clone();
        let plan = match self.strategy {
            Strategy::AllPermutations => Plan::AllPermutations(gens),
            Strategy::EvenSingleParamChange => Plan::Even(gens),
            Strategy::RandomSingleParamChange { seed } => Plan::Random(gens, seed),
            Strategy::Suggested { seed } => Plan::suggested(gens, seed),
        };
        log::debug!("providing parameters with {plan:?}");
        plan.start()
    }

    /// Give every generator the feedback for `result`.
    ///
    /// Every generator is called even if an earlier one fails; the first
    /// failure is returned.
    pub fn on_result(&self, result: &ExecutionResult) -> Result<()> {
        let mut first = None;
        for (index, gen) in self.gens.iter().enumerate() {
            if let Err(e) = gen.on_result(result, index) {
                log::warn!("feedback to parameter {index} failed: {e}");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Close every generator, returning the first failure.
    pub fn close(&self) -> Result<()> {
        let mut errors = CloseErrors::default();
        for gen in &self.gens {
            errors.record("parameter generator", gen.close());
        }
        errors.finish()
    }
}

type Gens = Vec<Arc<dyn ParamGen>>;

/// A restartable tuple source.
#[derive(Clone)]
enum Plan {
    AllPermutations(Gens),
    Even(Gens),
    Random(Gens, Option<u64>),
    Partitioned {
        len: usize,
        true_side: Box<(Vec<usize>, Plan)>,
        false_side: Box<(Vec<usize>, Plan)>,
    },
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::AllPermutations(g) => write!(f, "AllPermutations({})", g.len()),
            Plan::Even(g) => write!(f, "EvenSingleParamChange({})", g.len()),
            Plan::Random(g, _) => write!(f, "RandomSingleParamChange({})", g.len()),
            Plan::Partitioned {
                true_side,
                false_side,
                ..
            } => write!(f, "Partitioned({:?}, {:?})", true_side.1, false_side.1),
        }
    }
}

impl Plan {
    fn suggested(gens: Gens, seed: Option<u64>) -> Plan {
        let mut permuted = 0;
        Plan::partitioned(
            gens,
            |gen| gen.is_mutational(),
            Plan::Even,
            |rest| {
                Plan::partitioned(
                    rest,
                    |gen| {
                        let small = gen
                            .finite_len()
                            .map_or(false, |len| len <= MAX_PERMUTED_LEN);
                        let take = small && permuted < MAX_PERMUTED_PARAMS;
                        permuted += usize::from(take);
                        take
                    },
                    Plan::AllPermutations,
                    |rest| Plan::Random(rest, seed),
                )
            },
        )
    }

    fn partitioned(
        gens: Gens,
        mut pred: impl FnMut(&Arc<dyn ParamGen>) -> bool,
        true_plan: impl FnOnce(Gens) -> Plan,
        false_plan: impl FnOnce(Gens) -> Plan,
    ) -> Plan {
        let len = gens.len();
        let (mut t_idx, mut t_gens, mut f_idx, mut f_gens) = (vec![], vec![], vec![], vec![]);
        for (i, gen) in gens.into_iter().enumerate() {
            if pred(&gen) {
                t_idx.push(i);
                t_gens.push(gen);
            } else {
                f_idx.push(i);
                f_gens.push(gen);
            }
        }
        if f_gens.is_empty() {
            return true_plan(t_gens);
        }
        if t_gens.is_empty() {
            return false_plan(f_gens);
        }
        Plan::Partitioned {
            len,
            true_side: Box::new((t_idx, true_plan(t_gens))),
            false_side: Box::new((f_idx, false_plan(f_gens))),
        }
    }

    fn start(&self) -> Tuples {
        match self {
            Plan::AllPermutations(gens) => Box::new(AllPermutations::new(gens.clone())),
            Plan::Even(gens) => Box::new(Even::new(gens.clone())),
            Plan::Random(gens, seed) => Box::new(RandomChange::new(gens.clone(), *seed)),
            Plan::Partitioned {
                len,
                true_side,
                false_side,
            } => Box::new(Partitioned {
                len: *len,
                sides: [
                    Side::new(&true_side.0, true_side.1.clone()),
                    Side::new(&false_side.0, false_side.1.clone()),
                ],
            }),
        }
    }
}

struct AllPermutations {
    gens: Gens,
    iters: Vec<Box<dyn Iterator<Item = Param> + Send>>,
    current: Option<Vec<Param>>,
    started: bool,
}

impl AllPermutations {
    fn new(gens: Gens) -> Self {
        let mut iters: Vec<_> = gens.iter().map(|g| g.clone().values()).collect();
        let current = iters.iter_mut().map(|i| i.next()).collect();
        Self {
            gens,
            iters,
            current,
            started: false,
        }
    }
}

impl Iterator for AllPermutations {
    type Item = Vec<Param>;

    fn next(&mut self) -> Option<Vec<Param>> {
        if !self.started {
            self.started = true;
            return self.current.clone();
        }
        let current = self.current.as_mut()?;
        for i in (0..self.gens.len()).rev() {
            if let Some(next) = self.iters[i].next() {
                current[i] = next;
                return Some(current.clone());
            }
            // Odometer carry: restart this position and advance the previous.
            self.iters[i] = self.gens[i].clone().values();
            match self.iters[i].next() {
                Some(first) => current[i] = first,
                None => break,
            }
        }
        self.current = None;
        None
    }
}

struct Even {
    gens: Gens,
    iters: Vec<Box<dyn Iterator<Item = Param> + Send>>,
    cycled: Vec<bool>,
}

impl Even {
    fn new(gens: Gens) -> Self {
        Self {
            iters: gens.iter().map(|g| g.clone().values()).collect(),
            cycled: vec![false; gens.len()],
            gens,
        }
    }
}

impl Iterator for Even {
    type Item = Vec<Param>;

    fn next(&mut self) -> Option<Vec<Param>> {
        if self.gens.is_empty() || self.cycled.iter().all(|c| *c) {
            return None;
        }
        let mut tuple = Vec::with_capacity(self.gens.len());
        for i in 0..self.gens.len() {
            let param = match self.iters[i].next() {
                Some(param) => param,
                None => {
                    self.cycled[i] = true;
                    self.iters[i] = self.gens[i].clone().values();
                    self.iters[i].next()?
                }
            };
            tuple.push(param);
        }
        if self.cycled.iter().all(|c| *c) {
            return None;
        }
        Some(tuple)
    }
}

struct RandomChange {
    gens: Gens,
    iters: Vec<Box<dyn Iterator<Item = Param> + Send>>,
    positions: Vec<usize>,
    seen: HashSet<Vec<usize>>,
    rng: Rng,
    current: Option<Vec<Param>>,
    started: bool,
}

impl RandomChange {
    fn new(gens: Gens, seed: Option<u64>) -> Self {
        let mut iters: Vec<_> = gens.iter().map(|g| g.clone().values()).collect();
        let current = iters.iter_mut().map(|i| i.next()).collect();
        let positions = vec![0; gens.len()];
        Self {
            seen: HashSet::from([positions.clone()]),
            positions,
            gens,
            iters,
            rng: seed.map_or_else(Rng::from_entropy, Rng::new),
            current,
            started: false,
        }
    }

    /// Advance parameter `i`, restarting its generator when it runs out.
    fn advance(&mut self, i: usize) -> Option<Param> {
        if let Some(param) = self.iters[i].next() {
            self.positions[i] += 1;
            return Some(param);
        }
        self.iters[i] = self.gens[i].clone().values();
        self.positions[i] = 0;
        self.iters[i].next()
    }
}

impl Iterator for RandomChange {
    type Item = Vec<Param>;

    fn next(&mut self) -> Option<Vec<Param>> {
        if !self.started {
            self.started = true;
            return self.current.clone();
        }
        if self.current.is_none() || self.gens.is_empty() {
            return None;
        }
        for _ in 0..RANDOM_MAX_DUPES {
            let i = self.rng.below(self.gens.len());
            let Some(param) = self.advance(i) else {
                break;
            };
            let current = self.current.as_mut()?;
            current[i] = param;
            if self.seen.insert(self.positions.clone()) {
                if self.seen.len() >= RANDOM_SEEN_RESET {
                    self.seen.clear();
                }
                return Some(current.clone());
            }
        }
        log::debug!("random single-parameter change found no new tuples, stopping");
        self.current = None;
        None
    }
}

/// One side of a partition: a plan that restarts forever, remembering whether
/// it has ever run to completion.
struct Side {
    indices: Vec<usize>,
    plan: Plan,
    iter: Tuples,
    completed: bool,
}

impl Side {
    fn new(indices: &[usize], plan: Plan) -> Self {
        Self {
            indices: indices.to_vec(),
            iter: plan.start(),
            plan,
            completed: false,
        }
    }

    fn next(&mut self) -> Option<Vec<Param>> {
        if let Some(tuple) = self.iter.next() {
            return Some(tuple);
        }
        self.completed = true;
        self.iter = self.plan.start();
        // A plan that yields nothing even when fresh would restart forever.
        self.iter.next()
    }
}

struct Partitioned {
    len: usize,
    sides: [Side; 2],
}

impl Iterator for Partitioned {
    type Item = Vec<Param>;

    fn next(&mut self) -> Option<Vec<Param>> {
        if self.sides.iter().all(|s| s.completed) {
            return None;
        }
        let mut slots: Vec<Option<Param>> = vec![None; self.len];
        for side in &mut self.sides {
            let tuple = side.next()?;
            for (&i, param) in side.indices.iter().zip(tuple) {
                slots[i] = Some(param);
            }
        }
        slots.into_iter().collect()
    }
}
