//! The prioritized input queue of seeds awaiting mutation.

use crate::{invoke::ExecutionResult, lock, Result};
use std::{
    cmp::Ordering,
    collections::{HashSet, VecDeque},
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

/// A candidate seed plus what was observed when it last ran, if it ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    bytes: Vec<u8>,
    branch_hashes: Option<Vec<u64>>,
    nanos: Option<u64>,
}

impl TestCase {
    /// A test case that has not been executed, such as an initial seed.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            branch_hashes: None,
            nanos: None,
        }
    }

    /// A test case that was executed, covering `branch_hashes` in `nanos`
    /// nanoseconds.
    pub fn executed(bytes: Vec<u8>, branch_hashes: Vec<u64>, nanos: u64) -> Self {
        Self {
            bytes,
            branch_hashes: Some(branch_hashes),
            nanos: Some(nanos),
        }
    }

    /// Reassemble a test case from its parts.
    pub fn from_parts(bytes: Vec<u8>, branch_hashes: Option<Vec<u64>>, nanos: Option<u64>) -> Self {
        Self {
            bytes,
            branch_hashes,
            nanos,
        }
    }

    /// The input bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The per-branch stable hashes observed when this case ran.
    pub fn branch_hashes(&self) -> Option<&[u64]> {
        self.branch_hashes.as_deref()
    }

    /// How long this case took to run, in nanoseconds.
    pub fn nanos(&self) -> Option<u64> {
        self.nanos
    }

    /// `len * nanos`, or `None` when this case has not been timed. Lower is
    /// better.
    pub fn score(&self) -> Option<u128> {
        self.nanos
            .map(|n| self.bytes.len() as u128 * u128::from(n))
    }

    /// Order by score, with untimed cases after every timed one.
    pub fn cmp_score(&self, other: &Self) -> Ordering {
        match (self.score(), other.score()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    /// Reorder `cases` so that favored cases come first.
    ///
    /// Cases are sorted by score (stably), then walked in that order keeping a
    /// set of branch hashes seen so far. A case is favored when it has run and
    /// covers at least one hash not yet in the set. Favored cases come first,
    /// then the rest, each group in score order.
    ///
    /// ```
    /// use covfuzz::queue::TestCase;
    ///
    /// let a = TestCase::new(b"a".to_vec());
    /// let b = TestCase::executed(b"b".to_vec(), vec![1, 2], 10);
    /// let c = TestCase::executed(b"c".to_vec(), vec![2], 20);
    /// let d = TestCase::executed(b"d".to_vec(), vec![2, 3], 30);
    ///
    /// let culled = TestCase::culled(vec![a.clone(), d.clone(), c.clone(), b.clone()]);
    /// assert_eq!(culled, [b, d, c, a]);
    /// ```
    pub fn culled(mut cases: Vec<TestCase>) -> Vec<TestCase> {
        cases.sort_by(TestCase::cmp_score);
        let mut seen = HashSet::new();
        let (favored, unfavored): (Vec<_>, Vec<_>) = cases.into_iter().partition(|case| {
            case.branch_hashes.as_ref().map_or(false, |hashes| {
                // No short-circuit: every hash of a favored case is marked seen.
                hashes.iter().fold(false, |new, h| seen.insert(*h) | new)
            })
        });
        favored.into_iter().chain(unfavored).collect()
    }

    /// Take the input bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Aggregate statistics of every execution derived from a queue entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryStats {
    /// Total execution time, in nanoseconds.
    pub total_nanos: u64,
    /// Total number of branches covered.
    pub total_branch_count: u64,
    /// Number of executions.
    pub result_count: u64,
}

/// A dequeued seed currently being mutated.
pub struct QueueEntry {
    bytes: Arc<[u8]>,
    dequeued_index: i64,
    stats: Mutex<EntryStats>,
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("len", &self.bytes.len())
            .field("dequeued_index", &self.dequeued_index)
            .field("stats", &self.stats())
            .finish()
    }
}

impl QueueEntry {
    /// Create an entry. Negative indices are reserved for initial seeds that
    /// never went through a queue.
    pub fn new(bytes: impl Into<Arc<[u8]>>, dequeued_index: i64) -> Self {
        Self {
            bytes: bytes.into(),
            dequeued_index,
            stats: Mutex::new(EntryStats::default()),
        }
    }

    /// The seed bytes.
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    /// The position of this entry in its queue's dequeue order.
    pub fn dequeued_index(&self) -> i64 {
        self.dequeued_index
    }

    /// A snapshot of this entry's statistics.
    pub fn stats(&self) -> EntryStats {
        *lock(&self.stats)
    }

    /// Record an execution of a candidate derived from this entry.
    pub fn apply_result(&self, result: &ExecutionResult) {
        let mut stats = lock(&self.stats);
        stats.total_nanos = stats.total_nanos.saturating_add(result.nanos);
        stats.total_branch_count += result.trace.branches().len() as u64;
        stats.result_count += 1;
    }
}

/// A thread-safe queue of seeds.
///
/// Implementations must be safe to call from any thread.
pub trait InputQueue: Send + Sync {
    /// Append a test case. Never blocks.
    fn enqueue(&self, case: TestCase) -> Result<()>;

    /// Pop the next seed, re-culling first if anything was enqueued since the
    /// last dequeue. Returns `Ok(None)` immediately when the queue is empty.
    fn cull_and_dequeue(&self) -> Result<Option<QueueEntry>>;

    /// The number of pending test cases.
    fn len(&self) -> usize;

    /// Whether no test cases are pending.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release any resources held by the queue.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

type MutationListener = Box<dyn Fn(&VecDeque<TestCase>) -> Result<()> + Send + Sync>;

struct QueueState {
    pending: VecDeque<TestCase>,
    enqueued_since_dequeue: bool,
    counter: i64,
}

/// The default, in-memory [`InputQueue`].
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::queue::{InMemoryQueue, InputQueue, TestCase};
///
/// let queue = InMemoryQueue::new();
/// queue.enqueue(TestCase::new(b"slow".to_vec()))?;
/// queue.enqueue(TestCase::executed(b"fast".to_vec(), vec![7], 1))?;
///
/// let entry = queue.cull_and_dequeue()?.unwrap();
/// assert_eq!(&entry.bytes()[..], b"fast");
/// assert_eq!(entry.dequeued_index(), 0);
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
    on_mutated: Option<MutationListener>,
}

impl fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("InMemoryQueue")
            .field("pending", &state.pending.len())
            .field("counter", &state.counter)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_cases(Vec::new())
    }

    /// Create a queue holding `cases`, such as ones recovered from disk. The
    /// cases are culled before the first dequeue, and dequeue indices start
    /// at `cases.len()`.
    pub fn with_cases(cases: Vec<TestCase>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                enqueued_since_dequeue: !cases.is_empty(),
                counter: cases.len() as i64,
                pending: cases.into(),
            }),
            not_empty: Condvar::new(),
            on_mutated: None,
        }
    }

    /// Call `listener` with the pending test cases, under the queue lock,
    /// after every enqueue and every dequeue.
    ///
    /// A failing listener fails the operation that triggered it. An enqueue
    /// still takes effect, but a dequeue is rolled back so that its seed stays
    /// at the front of the queue.
    pub fn on_mutated(
        mut self,
        listener: impl Fn(&VecDeque<TestCase>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_mutated = Some(Box::new(listener));
        self
    }

    /// Call `f` with the pending test cases, under the queue lock.
    pub fn with_pending<R>(&self, f: impl FnOnce(&VecDeque<TestCase>) -> R) -> R {
        f(&lock(&self.state).pending)
    }

    /// A copy of the pending test cases, in their current order.
    pub fn snapshot(&self) -> Vec<TestCase> {
        lock(&self.state).pending.iter().cloned().collect()
    }

    fn notify(&self, pending: &VecDeque<TestCase>) -> Result<()> {
        match &self.on_mutated {
            Some(listener) => listener(pending),
            None => Ok(()),
        }
    }

    fn dequeue_locked(&self, state: &mut QueueState) -> Result<Option<QueueEntry>> {
        if state.pending.is_empty() {
            return Ok(None);
        }
        if state.enqueued_since_dequeue {
            let cases = std::mem::take(&mut state.pending);
            state.pending = TestCase::culled(cases.into()).into();
            state.enqueued_since_dequeue = false;
            log::debug!("culled input queue of {} cases", state.pending.len());
        }
        let Some(case) = state.pending.pop_front() else {
            return Ok(None);
        };
        if let Err(e) = self.notify(&state.pending) {
            state.pending.push_front(case);
            return Err(e);
        }
        let entry = QueueEntry::new(case.into_bytes(), state.counter);
        state.counter += 1;
        Ok(Some(entry))
    }

    /// Like [`InputQueue::cull_and_dequeue`], but waits up to `timeout` for a
    /// test case to be enqueued if the queue is empty.
    pub fn cull_and_dequeue_timeout(&self, timeout: Duration) -> Result<Option<QueueEntry>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        while state.pending.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        self.dequeue_locked(&mut state)
    }
}

impl InputQueue for InMemoryQueue {
    fn enqueue(&self, case: TestCase) -> Result<()> {
        let mut state = lock(&self.state);
        state.pending.push_back(case);
        state.enqueued_since_dequeue = true;
        self.not_empty.notify_one();
        self.notify(&state.pending)
    }

    fn cull_and_dequeue(&self) -> Result<Option<QueueEntry>> {
        let mut state = lock(&self.state);
        self.dequeue_locked(&mut state)
    }

    fn len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    fn close(&self) -> Result<()> {
        let state = lock(&self.state);
        self.notify(&state.pending)
    }
}
