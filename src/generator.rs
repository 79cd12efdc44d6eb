//! The coverage-guided byte-array generator.
//!
//! A [`ByteArrayGenerator`] pulls seeds from its [`InputQueue`], runs every
//! deterministic stage and then havoc over each one, and learns from the
//! execution results of its candidates: an execution whose coverage
//! fingerprint was never seen before is enqueued as a new seed.

use crate::{
    cache::{CoverageCache, InMemoryCache},
    error::CloseErrors,
    invoke::ExecutionResult,
    lock,
    mutators::{self as m, MutationConfig, Width},
    param::{Param, ParamGen, Value},
    queue::{InMemoryQueue, InputQueue, QueueEntry, TestCase},
    Result, Rng,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

/// Creates the input queue of a new generator.
pub type QueueFactory = Arc<dyn Fn() -> Result<Box<dyn InputQueue>> + Send + Sync>;

/// Creates the coverage cache of a new generator.
pub type CacheFactory = Arc<dyn Fn() -> Result<Box<dyn CoverageCache>> + Send + Sync>;

/// How long a generator runs before havoc may pick larger block sizes, by
/// default.
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(10 * 60);

/// Configuration for a [`ByteArrayGenerator`].
///
/// # Example
///
/// ```
/// use covfuzz::{ByteArrayConfig, MutationConfig};
///
/// let config = ByteArrayConfig::default()
///     .initial_values(vec![b"GIF89a".to_vec()])
///     .dictionary(vec![b"\x21\xf9\x04".to_vec()])
///     .mutation(MutationConfig::default().havoc_cycles(128))
///     .seed(42);
/// assert_eq!(config.initial_values.len(), 1);
/// ```
#[derive(Clone)]
pub struct ByteArrayConfig {
    /// Seeds enqueued when the generator is created, and yielded as-is when
    /// the queue is empty and nothing was ever dequeued.
    pub initial_values: Vec<Vec<u8>>,
    /// Dictionary tokens for the dictionary stage.
    pub dictionary: Vec<Vec<u8>>,
    /// Mutation settings.
    pub mutation: MutationConfig,
    /// Seed for the generator's random numbers, or `None` for entropy.
    pub seed: Option<u64>,
    /// Creates the generator's input queue.
    pub queue: QueueFactory,
    /// Creates the generator's coverage cache.
    pub cache: CacheFactory,
    /// How long after its first dequeue havoc stays at the smallest
    /// block-size tier. After that, one more tier opens up per dequeued seed,
    /// up to three.
    pub warmup: Duration,
    /// Consecutive empty batches after which the candidate stream ends, or
    /// `None` to keep generating until the generator is closed.
    ///
    /// A batch is empty when the queue has nothing to dequeue and the
    /// fallbacks yield nothing, e.g. with no initial values. Without a limit
    /// such a stream spins until another thread enqueues a seed or closes the
    /// generator.
    pub max_empty_batches: Option<usize>,
}

impl Default for ByteArrayConfig {
    fn default() -> Self {
        Self {
            initial_values: vec![b"test".to_vec()],
            dictionary: Vec::new(),
            mutation: MutationConfig::default(),
            seed: None,
            queue: Arc::new(|| Ok(Box::new(InMemoryQueue::new()))),
            cache: Arc::new(|| Ok(Box::new(InMemoryCache::new()))),
            warmup: DEFAULT_WARMUP,
            max_empty_batches: None,
        }
    }
}

impl fmt::Debug for ByteArrayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArrayConfig")
            .field("initial_values", &self.initial_values.len())
            .field("dictionary", &self.dictionary.len())
            .field("mutation", &self.mutation)
            .field("seed", &self.seed)
            .field("warmup", &self.warmup)
            .field("max_empty_batches", &self.max_empty_batches)
            .finish_non_exhaustive()
    }
}

impl ByteArrayConfig {
    /// Set the initial seeds.
    pub fn initial_values(mut self, values: Vec<Vec<u8>>) -> Self {
        self.initial_values = values;
        self
    }

    /// Set the dictionary tokens.
    pub fn dictionary(mut self, tokens: Vec<Vec<u8>>) -> Self {
        self.dictionary = tokens;
        self
    }

    /// Set the mutation settings.
    pub fn mutation(mut self, mutation: MutationConfig) -> Self {
        self.mutation = mutation;
        self
    }

    /// Seed the generator's random numbers.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set how the generator's input queue is created.
    pub fn queue(
        mut self,
        factory: impl Fn() -> Result<Box<dyn InputQueue>> + Send + Sync + 'static,
    ) -> Self {
        self.queue = Arc::new(factory);
        self
    }

    /// Set how the generator's coverage cache is created.
    pub fn cache(
        mut self,
        factory: impl Fn() -> Result<Box<dyn CoverageCache>> + Send + Sync + 'static,
    ) -> Self {
        self.cache = Arc::new(factory);
        self
    }

    /// Set how long havoc stays at the smallest block-size tier.
    pub fn warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    /// End the candidate stream after `limit` consecutive empty batches.
    pub fn max_empty_batches(mut self, limit: usize) -> Self {
        self.max_empty_batches = Some(limit);
        self
    }
}

/// Aggregate statistics of a generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Total execution time of its candidates, in nanoseconds.
    pub total_nanos: u64,
    /// Total number of branches its candidates covered.
    pub branch_count: u64,
    /// Number of executed candidates.
    pub result_count: u64,
    /// Number of seeds dequeued.
    pub queue_cycle: u64,
}

#[derive(Debug)]
struct Progress {
    stats: GeneratorStats,
    started: Option<Instant>,
    warmup: Duration,
}

impl Progress {
    /// Count a dequeued seed, starting the warmup clock on the first one.
    fn dequeued(&mut self) {
        self.stats.queue_cycle += 1;
        self.started.get_or_insert_with(Instant::now);
    }

    /// The number of block-size tiers havoc may pick from.
    fn block_tiers(&self) -> usize {
        match self.started {
            Some(started) if started.elapsed() >= self.warmup => {
                self.stats.queue_cycle.clamp(1, 3) as usize
            }
            _ => 1,
        }
    }
}

/// A mutational [`ParamGen`] over byte buffers.
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::{ByteArrayConfig, ByteArrayGenerator, ParamGen};
/// use std::sync::Arc;
///
/// let gen = Arc::new(ByteArrayGenerator::new(ByteArrayConfig::default().seed(1))?);
///
/// // The first candidate flips the lowest bit of the initial seed, "test".
/// let first = gen.clone().values().next().unwrap();
/// assert_eq!(first.value().as_bytes(), Some(&b"uest"[..]));
/// assert_eq!(first.entry().unwrap().dequeued_index(), 0);
///
/// gen.close()?;
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
pub struct ByteArrayGenerator {
    initial_values: Vec<Vec<u8>>,
    dictionary: Arc<[Vec<u8>]>,
    mutation: MutationConfig,
    queue: Box<dyn InputQueue>,
    cache: Box<dyn CoverageCache>,
    rng: Mutex<Rng>,
    last_entry: Mutex<Option<Arc<QueueEntry>>>,
    progress: Mutex<Progress>,
    max_empty_batches: Option<usize>,
    closed: AtomicBool,
}

impl fmt::Debug for ByteArrayGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteArrayGenerator")
            .field("queued", &self.queue.len())
            .field("fingerprints", &self.cache.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ByteArrayGenerator {
    /// Create a generator, its queue, and its cache, and enqueue the initial
    /// values.
    pub fn new(config: ByteArrayConfig) -> Result<Self> {
        let queue = (config.queue)()?;
        let cache = match (config.cache)() {
            Ok(cache) => cache,
            Err(e) => {
                if let Err(close) = queue.close() {
                    log::error!("failed to close input queue: {close}");
                }
                return Err(e);
            }
        };

        let mut dictionary = config.dictionary;
        dictionary.sort();
        dictionary.dedup();
        dictionary.sort_by_key(Vec::len);

        let gen = Self {
            dictionary: dictionary.into(),
            mutation: config.mutation,
            queue,
            cache,
            rng: Mutex::new(config.seed.map_or_else(Rng::from_entropy, Rng::new)),
            last_entry: Mutex::new(None),
            progress: Mutex::new(Progress {
                stats: GeneratorStats::default(),
                started: None,
                warmup: config.warmup,
            }),
            max_empty_batches: config.max_empty_batches,
            closed: AtomicBool::new(false),
            initial_values: config.initial_values,
        };
        for value in &gen.initial_values {
            gen.queue.enqueue(TestCase::new(value.clone()))?;
        }
        log::debug!(
            "created byte-array generator with {} initial values and {} dictionary tokens",
            gen.initial_values.len(),
            gen.dictionary.len()
        );
        Ok(gen)
    }

    /// A snapshot of this generator's statistics.
    pub fn stats(&self) -> GeneratorStats {
        lock(&self.progress).stats
    }

    /// The input queue.
    pub fn queue(&self) -> &dyn InputQueue {
        &*self.queue
    }

    /// The coverage cache.
    pub fn cache(&self) -> &dyn CoverageCache {
        &*self.cache
    }

    fn havoc_rng(&self) -> Rng {
        lock(&self.rng).fork()
    }

    /// The candidates for the next seed: every stage over a freshly dequeued
    /// entry, or one of the fallbacks when the queue is empty.
    fn next_batch(&self) -> Box<dyn Iterator<Item = Param> + Send> {
        let dequeued = self.queue.cull_and_dequeue().unwrap_or_else(|e| {
            log::warn!("failed to dequeue a seed, falling back: {e}");
            None
        });
        if let Some(entry) = dequeued {
            let entry = Arc::new(entry);
            log::debug!(
                "dequeued seed #{} of {} bytes",
                entry.dequeued_index(),
                entry.bytes().len()
            );
            *lock(&self.last_entry) = Some(entry.clone());
            let block_tiers = {
                let mut progress = lock(&self.progress);
                progress.dequeued();
                progress.block_tiers()
            };
            return self.stages(entry, block_tiers);
        }

        if let Some(entry) = lock(&self.last_entry).clone() {
            log::trace!("queue empty, running havoc over the last seed");
            let block_tiers = lock(&self.progress).block_tiers();
            let seed = entry.bytes().clone();
            let havoc = m::havoc(seed, &self.mutation, self.havoc_rng(), block_tiers);
            return tag(entry, havoc);
        }

        log::trace!("queue empty, yielding the initial values");
        let len = self.initial_values.len() as i64;
        let initial: Vec<Param> = self
            .initial_values
            .iter()
            .enumerate()
            .map(|(i, value)| Param::Tracked {
                value: Value::Bytes(value.clone()),
                entry: Arc::new(QueueEntry::new(value.clone(), i as i64 - len)),
            })
            .collect();
        Box::new(initial.into_iter())
    }

    fn stages(
        &self,
        entry: Arc<QueueEntry>,
        block_tiers: usize,
    ) -> Box<dyn Iterator<Item = Param> + Send> {
        let seed = entry.bytes().clone();
        let limits = &self.mutation.limits;
        let candidates = m::flip_bits(seed.clone(), 1)
            .chain(m::flip_bits(seed.clone(), 2))
            .chain(m::flip_bits(seed.clone(), 4))
            .chain(m::flip_bytes(seed.clone(), 1))
            .chain(m::flip_bytes(seed.clone(), 2))
            .chain(m::flip_bytes(seed.clone(), 4))
            .chain(m::arith(seed.clone(), Width::W8, limits))
            .chain(m::arith(seed.clone(), Width::W16, limits))
            .chain(m::arith(seed.clone(), Width::W32, limits))
            .chain(m::interesting(seed.clone(), Width::W8, limits))
            .chain(m::interesting(seed.clone(), Width::W16, limits))
            .chain(m::interesting(seed.clone(), Width::W32, limits))
            .chain(m::dictionary(seed.clone(), self.dictionary.clone()))
            .chain(m::havoc(seed, &self.mutation, self.havoc_rng(), block_tiers));
        tag(entry, candidates)
    }
}

fn tag(
    entry: Arc<QueueEntry>,
    candidates: impl Iterator<Item = Vec<u8>> + Send + 'static,
) -> Box<dyn Iterator<Item = Param> + Send> {
    Box::new(candidates.map(move |bytes| Param::Tracked {
        value: Value::Bytes(bytes),
        entry: entry.clone(),
    }))
}

/// The candidate stream of a [`ByteArrayGenerator`]. Runs until the generator
/// is closed or gives up on empty batches.
struct Candidates {
    gen: Arc<ByteArrayGenerator>,
    batch: Box<dyn Iterator<Item = Param> + Send>,
    empty_batches: usize,
}

impl Iterator for Candidates {
    type Item = Param;

    fn next(&mut self) -> Option<Param> {
        loop {
            if let Some(param) = self.batch.next() {
                self.empty_batches = 0;
                return Some(param);
            }
            if self.gen.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(limit) = self.gen.max_empty_batches {
                if self.empty_batches >= limit {
                    log::warn!("byte-array generator has nothing left to yield");
                    return None;
                }
            }
            if self.empty_batches > 0 {
                thread::yield_now();
            }
            self.empty_batches += 1;
            self.batch = self.gen.next_batch();
        }
    }
}

impl ParamGen for ByteArrayGenerator {
    fn values(self: Arc<Self>) -> Box<dyn Iterator<Item = Param> + Send> {
        Box::new(Candidates {
            gen: self,
            batch: Box::new(std::iter::empty()),
            empty_batches: 0,
        })
    }

    fn is_mutational(&self) -> bool {
        true
    }

    fn on_result(&self, result: &ExecutionResult, index: usize) -> Result<()> {
        let branches = result.trace.branches().len() as u64;
        {
            let mut progress = lock(&self.progress);
            let stats = &mut progress.stats;
            stats.total_nanos = stats.total_nanos.saturating_add(result.nanos);
            stats.branch_count += branches;
            stats.result_count += 1;
        }

        let Some(param) = result.params.get(index) else {
            return Ok(());
        };
        if let Some(entry) = param.entry() {
            entry.apply_result(result);
        }

        let fingerprint = result.trace.stable_hash(true);
        if !self.cache.check_unique_and_store(fingerprint)? {
            return Ok(());
        }
        let Some(bytes) = param.value().as_bytes() else {
            return Ok(());
        };
        log::debug!("new coverage {fingerprint:#018x} over {branches} branches, enqueueing");
        self.queue.enqueue(TestCase::executed(
            bytes.to_vec(),
            result.trace.branch_hashes(true).to_vec(),
            result.nanos,
        ))
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let mut errors = CloseErrors::default();
        errors.record("input queue", self.queue.close());
        errors.record("coverage cache", self.cache.close());
        errors.finish()
    }
}
