//! The fuzz loop.

use crate::{
    cache::{CoverageCache, InMemoryCache},
    error::CloseErrors,
    generator::ByteArrayConfig,
    invoke::{
        Completion, CurrentThreadInvoker, ExecutionResult, Failure, Harness, Invoker, Outcome,
    },
    lock, param,
    provider::ParamProvider,
    Error, Result, ValueKind,
};
use crossbeam::channel::{self, RecvTimeoutError};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

/// How long the loop waits for in-flight executions when it stops.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1000 * 24 * 60 * 60);

/// Observes every execution before generators get their feedback.
pub trait PostSubmission: Send + Sync {
    /// Called once per execution, on whichever thread ran it.
    fn after_execution(&self, result: &ExecutionResult) -> Result<()>;

    /// Called once when the loop stops.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

type UniqueCallback = Box<dyn Fn(&ExecutionResult) + Send + Sync>;

/// A [`PostSubmission`] hook that calls back the first time any execution
/// takes a given path.
///
/// This is independent of the generators' own novelty tracking: it keeps its
/// own fingerprint set and may ignore hit counts when they don't.
///
/// # Example
///
/// ```
/// use covfuzz::fuzzer::TrackUniqueBranches;
///
/// let hook = TrackUniqueBranches::new(|result| {
///     println!("new path: {:?} -> {:?}", result.params, result.outcome);
/// })
/// .include_hits(false);
/// assert_eq!(hook.total_executions(), 0);
/// ```
pub struct TrackUniqueBranches {
    include_hits: bool,
    backing: Box<dyn CoverageCache>,
    executions: AtomicU64,
    on_unique: UniqueCallback,
}

impl fmt::Debug for TrackUniqueBranches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackUniqueBranches")
            .field("include_hits", &self.include_hits)
            .field("unique", &self.backing.len())
            .field("executions", &self.total_executions())
            .finish_non_exhaustive()
    }
}

impl TrackUniqueBranches {
    /// Call `on_unique` for every execution whose path is new, counting hit
    /// counts and using an in-memory fingerprint set.
    pub fn new(on_unique: impl Fn(&ExecutionResult) + Send + Sync + 'static) -> Self {
        Self {
            include_hits: true,
            backing: Box::new(InMemoryCache::new()),
            executions: AtomicU64::new(0),
            on_unique: Box::new(on_unique),
        }
    }

    /// Set whether executions that differ only in hit counts are distinct.
    pub fn include_hits(mut self, include_hits: bool) -> Self {
        self.include_hits = include_hits;
        self
    }

    /// Use `backing` as the fingerprint set.
    pub fn backing(mut self, backing: Box<dyn CoverageCache>) -> Self {
        self.backing = backing;
        self
    }

    /// The number of executions observed.
    pub fn total_executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// The number of distinct paths observed.
    pub fn unique_count(&self) -> usize {
        self.backing.len()
    }
}

impl PostSubmission for TrackUniqueBranches {
    fn after_execution(&self, result: &ExecutionResult) -> Result<()> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let fingerprint = result.trace.stable_hash(self.include_hits);
        if self.backing.check_unique_and_store(fingerprint)? {
            log::debug!("unique path {fingerprint:#018x}");
            (self.on_unique)(result);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.backing.close()
    }
}

/// Build a [`ParamProvider`] with the suggested generator for each of
/// `kinds`, configuring the `i`th byte-array generator with `config(i)`.
pub fn suggested_params(
    kinds: &[ValueKind],
    config: impl Fn(usize) -> ByteArrayConfig,
) -> Result<ParamProvider> {
    let mut gens = Vec::with_capacity(kinds.len());
    for (i, kind) in kinds.iter().enumerate() {
        match param::suggested(*kind, &config(i)) {
            Ok(gen) => gens.push(gen),
            Err(e) => {
                let mut errors = CloseErrors::default();
                for gen in &gens {
                    errors.record("parameter generator", gen.close());
                }
                if let Err(close) = errors.finish() {
                    log::error!("failed to close parameter generator: {close}");
                }
                return Err(e);
            }
        }
    }
    Ok(ParamProvider::suggested(gens))
}

type Latch = Arc<Mutex<Option<Error>>>;

/// Record an infrastructure failure: latch it to stop the loop, or just log
/// it.
fn record_failure(latch: &Latch, stop_on_failure: bool, e: Error) {
    if stop_on_failure {
        log::warn!("execution failed, stopping: {e}");
        lock(latch).get_or_insert(e);
    } else {
        log::warn!("execution failed, continuing: {e}");
    }
}

fn feedback(
    result: Result<ExecutionResult>,
    hooks: &[Arc<dyn PostSubmission>],
    params: &ParamProvider,
) -> Result<()> {
    let result = result?;
    for hook in hooks {
        hook.after_execution(&result)?;
    }
    params.on_result(&result)
}

/// Drives a harness with parameter tuples until stopped or out of tuples.
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::{
///     fuzzer::{self, TrackUniqueBranches},
///     invoke::{Harness, Target},
///     tracer::ManualTracer,
///     ByteArrayConfig, Fuzzer, Value, ValueKind,
/// };
/// use std::sync::{atomic::AtomicBool, Arc};
///
/// let tracer = Arc::new(ManualTracer::new());
/// let unit = tracer.unit("demo", "is_even");
/// let target = {
///     let tracer = tracer.clone();
///     Target::new("is_even", vec![ValueKind::I8], move |args| match args {
///         [Value::I8(x)] if x % 2 == 0 => {
///             tracer.branch(unit, 0, 1);
///             Ok(Value::Bool(true))
///         }
///         _ => {
///             tracer.branch(unit, 0, 2);
///             Ok(Value::Bool(false))
///         }
///     })
/// };
///
/// let params = fuzzer::suggested_params(&[ValueKind::I8], |_| ByteArrayConfig::default())?;
/// let fuzzer = Fuzzer::new(Harness::new(target, tracer.clone(), tracer), params)
///     .hook(TrackUniqueBranches::new(|result| println!("{:?}", result.params)));
///
/// // Suggested 8-bit values are finite, so this runs to completion.
/// fuzzer.fuzz(&AtomicBool::new(false))?;
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
pub struct Fuzzer {
    harness: Arc<Harness>,
    params: ParamProvider,
    invoker: Arc<dyn Invoker>,
    hooks: Vec<Arc<dyn PostSubmission>>,
    stop_on_failure: bool,
    shutdown_timeout: Duration,
}

impl fmt::Debug for Fuzzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fuzzer")
            .field("harness", &self.harness)
            .field("params", &self.params)
            .field("hooks", &self.hooks.len())
            .field("stop_on_failure", &self.stop_on_failure)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish_non_exhaustive()
    }
}

impl Fuzzer {
    /// A fuzzer for `harness` fed by `params`, running on the current thread
    /// with no hooks.
    pub fn new(harness: Harness, params: ParamProvider) -> Self {
        Self {
            harness: Arc::new(harness),
            params,
            invoker: Arc::new(CurrentThreadInvoker::new()),
            hooks: Vec::new(),
            stop_on_failure: true,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Dispatch executions through `invoker`.
    pub fn invoker(mut self, invoker: impl Invoker + 'static) -> Self {
        self.invoker = Arc::new(invoker);
        self
    }

    /// Append a post-submission hook.
    pub fn hook(self, hook: impl PostSubmission + 'static) -> Self {
        self.shared_hook(Arc::new(hook))
    }

    /// Append a post-submission hook that the caller keeps a handle to.
    pub fn shared_hook(mut self, hook: Arc<dyn PostSubmission>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Set whether infrastructure failures stop the loop. On by default.
    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Set how long to wait for in-flight executions when stopping.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The harness.
    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// The parameter provider.
    pub fn params(&self) -> &ParamProvider {
        &self.params
    }

    /// Run until `stop` is set or the parameter tuples run out.
    ///
    /// The first execution is awaited; if its parameters do not match the
    /// target's signature, fails with
    /// [`FirstRunFailed`][crate::ErrorKind::FirstRunFailed] before any hook
    /// runs. Whatever happens, the invoker is shut down and every generator
    /// and hook closed before returning. A close failure takes precedence over
    /// a shutdown failure, which takes precedence over a loop failure.
    pub fn fuzz(&self, stop: &AtomicBool) -> Result<()> {
        log::info!("fuzzing {}", self.harness.target().name());
        let latch: Latch = Arc::default();
        let mut result = self.run(stop, &latch);

        let shutdown = self.invoker.shutdown_and_wait(self.shutdown_timeout);
        if let Ok(false) = shutdown {
            log::warn!("invoker did not finish within {:?}", self.shutdown_timeout);
        }
        if result.is_ok() {
            if let Some(e) = lock(&latch).take() {
                result = Err(e);
            }
        }
        result = supersede(result, shutdown.map(drop));

        let mut errors = CloseErrors::default();
        errors.record("parameter provider", self.params.close());
        for hook in &self.hooks {
            errors.record("post-submission hook", hook.close());
        }
        result = supersede(result, errors.finish());

        match &result {
            Ok(()) => log::info!("fuzzing {} stopped", self.harness.target().name()),
            Err(e) => log::info!("fuzzing {} failed: {e}", self.harness.target().name()),
        }
        result
    }

    /// Run until `duration` has passed or the parameter tuples run out.
    pub fn fuzz_for(&self, duration: Duration) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let (cancel, cancelled) = channel::bounded::<()>(0);
        let timer = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("covfuzz-timer".into())
                .spawn(move || {
                    if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(duration) {
                        log::debug!("fuzzing time of {duration:?} is up");
                        stop.store(true, Ordering::Release);
                    }
                })?
        };
        let result = self.fuzz(&stop);
        drop(cancel);
        if timer.join().is_err() {
            log::error!("fuzz timer panicked");
        }
        result
    }

    fn run(&self, stop: &AtomicBool, latch: &Latch) -> Result<()> {
        let mut first = true;
        let mut dispatched = 0u64;
        for tuple in self.params.iter() {
            if stop.load(Ordering::Acquire) {
                log::info!("stop requested after {dispatched} executions");
                break;
            }
            if let Some(e) = lock(latch).take() {
                return Err(e);
            }
            dispatched += 1;

            if first {
                first = false;
                let (tx, rx) = channel::bounded(1);
                let done: Completion = Box::new(move |result: Result<ExecutionResult>| {
                    let _ = tx.send(result);
                });
                self.invoker.invoke(&self.harness, tuple, done)?;
                let result: ExecutionResult = rx
                    .recv()
                    .map_err(|_| Error::other("first execution never completed"))??;
                if let Outcome::Failure(Failure::SignatureMismatch { expected, actual }) =
                    &result.outcome
                {
                    log::error!("first run failed: expected {expected:?}, got {actual:?}");
                    return Err(Error::first_run_failed(expected.clone(), actual.clone()));
                }
                if let Err(e) = feedback(Ok(result), &self.hooks, &self.params) {
                    record_failure(latch, self.stop_on_failure, e);
                }
                continue;
            }

            let hooks = self.hooks.clone();
            let params = self.params.clone();
            let failures = latch.clone();
            let stop_on_failure = self.stop_on_failure;
            let done: Completion = Box::new(move |result: Result<ExecutionResult>| {
                if let Err(e) = feedback(result, &hooks, &params) {
                    record_failure(&failures, stop_on_failure, e);
                }
            });
            if let Err(e) = self.invoker.invoke(&self.harness, tuple, done) {
                record_failure(latch, self.stop_on_failure, e);
            }
        }
        log::debug!("dispatched {dispatched} executions");
        Ok(())
    }
}

/// Prefer `later`'s error over `earlier`'s, logging whichever is dropped.
fn supersede(earlier: Result<()>, later: Result<()>) -> Result<()> {
    match (earlier, later) {
        (earlier, Ok(())) => earlier,
        (Ok(()), Err(e)) => Err(e),
        (Err(dropped), Err(e)) => {
            log::error!("superseded by a later failure: {dropped}");
            Err(e)
        }
    }
}
