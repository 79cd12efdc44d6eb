//! Running a target under a tracer, on the current thread or a pool.

use crate::{
    coverage::{SymbolResolver, TraceResult},
    param::{Param, Value, ValueKind},
    tracer::Tracer,
    Error, Result,
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

type TargetFn = dyn Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync;

/// A function being fuzzed, with its declared parameter kinds.
///
/// The function returns `Err` to report a failure, which is recorded in the
/// execution result like a panic would be.
pub struct Target {
    name: String,
    param_kinds: Vec<ValueKind>,
    func: Box<TargetFn>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("param_kinds", &self.param_kinds)
            .finish_non_exhaustive()
    }
}

impl Target {
    /// Create a target named `name` taking parameters of `param_kinds`.
    pub fn new(
        name: impl Into<String>,
        param_kinds: Vec<ValueKind>,
        func: impl Fn(&[Value]) -> std::result::Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            param_kinds,
            func: Box::new(func),
        }
    }

    /// The target's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The target's declared parameter kinds.
    pub fn param_kinds(&self) -> &[ValueKind] {
        &self.param_kinds
    }
}

/// Why an execution failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The target returned an error.
    Raised(String),
    /// The target panicked.
    Panic(String),
    /// The parameters did not match the target's declared kinds, so the
    /// target was never called.
    SignatureMismatch {
        /// The declared kinds.
        expected: Vec<ValueKind>,
        /// The supplied kinds.
        actual: Vec<ValueKind>,
    },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Raised(msg) => write!(f, "target failed: {msg}"),
            Failure::Panic(msg) => write!(f, "target panicked: {msg}"),
            Failure::SignatureMismatch { expected, actual } => {
                write!(f, "expected parameters {expected:?}, got {actual:?}")
            }
        }
    }
}

/// The outcome of an execution.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The target returned a value.
    Ok(Value),
    /// The target failed.
    Failure(Failure),
}

impl Outcome {
    /// The failure, if the execution failed.
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Failure(f) => Some(f),
        }
    }
}

/// Everything observed about one execution of a target.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    /// The parameters, as generated, including their origins.
    pub params: Vec<Param>,
    /// The branches taken.
    pub trace: Arc<TraceResult>,
    /// What the target did.
    pub outcome: Outcome,
    /// Wall-clock execution time, in nanoseconds.
    pub nanos: u64,
}

/// A target plus the tracer and symbol resolver used to observe it.
pub struct Harness {
    target: Target,
    tracer: Arc<dyn Tracer>,
    resolver: Arc<dyn SymbolResolver>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

impl Harness {
    /// Create a harness.
    pub fn new(
        target: Target,
        tracer: Arc<dyn Tracer>,
        resolver: Arc<dyn SymbolResolver>,
    ) -> Self {
        Self {
            target,
            tracer,
            resolver,
        }
    }

    /// The target.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Run the target once with `params`, tracing it on the current thread.
    ///
    /// Target failures and panics are part of the returned result. Errors are
    /// reserved for the tracer failing.
    ///
    /// # Example
    ///
    /// ```
    /// # fn foo() -> covfuzz::Result<()> {
    /// use covfuzz::{
    ///     invoke::{Harness, Outcome, Target},
    ///     tracer::ManualTracer,
    ///     Param, Value, ValueKind,
    /// };
    /// use std::sync::Arc;
    ///
    /// let tracer = Arc::new(ManualTracer::new());
    /// let target = Target::new("negate", vec![ValueKind::I32], |args| match args {
    ///     [Value::I32(x)] => Ok(Value::I32(x.wrapping_neg())),
    ///     _ => Err("bad arguments".into()),
    /// });
    /// let harness = Harness::new(target, tracer.clone(), tracer);
    ///
    /// let result = harness.execute(vec![Param::Raw(Value::I32(5))])?;
    /// assert_eq!(result.outcome, Outcome::Ok(Value::I32(-5)));
    /// # Ok(())
    /// # }
    /// # foo().unwrap();
    /// ```
    pub fn execute(&self, params: Vec<Param>) -> Result<ExecutionResult> {
        let actual: Vec<ValueKind> = params.iter().map(|p| p.value().kind()).collect();
        if actual != self.target.param_kinds {
            log::debug!(
                "not calling {}: expected {:?}, got {actual:?}",
                self.target.name,
                self.target.param_kinds
            );
            return Ok(ExecutionResult {
                params,
                trace: Arc::new(TraceResult::default()),
                outcome: Outcome::Failure(Failure::SignatureMismatch {
                    expected: self.target.param_kinds.clone(),
                    actual,
                }),
                nanos: 0,
            });
        }

        let values: Vec<Value> = params.iter().map(|p| p.value().clone()).collect();
        let thread = thread::current().id();
        self.tracer.start_trace(thread)?;
        let start = Instant::now();
        let returned = panic::catch_unwind(AssertUnwindSafe(|| (self.target.func)(&values)));
        let nanos = u64::try_from(start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let raw = self.tracer.stop_trace(thread)?;

        let outcome = match returned {
            Ok(Ok(value)) => Outcome::Ok(value),
            Ok(Err(msg)) => Outcome::Failure(Failure::Raised(msg)),
            Err(payload) => Outcome::Failure(Failure::Panic(panic_message(&*payload))),
        };
        Ok(ExecutionResult {
            params,
            trace: Arc::new(TraceResult::resolve(&raw, &*self.resolver)),
            outcome,
            nanos,
        })
    }
}

/// Called with the result of an invocation, on whichever thread ran it.
pub type Completion = Box<dyn FnOnce(Result<ExecutionResult>) + Send>;

/// Dispatches executions of a harness.
pub trait Invoker: Send + Sync {
    /// Run `harness` with `params` and pass the result to `done`.
    ///
    /// Fails without calling `done` if the invocation could not be dispatched,
    /// for example because the invoker was shut down.
    fn invoke(&self, harness: &Arc<Harness>, params: Vec<Param>, done: Completion) -> Result<()>;

    /// Stop accepting work and wait up to `timeout` for dispatched work to
    /// finish. Returns whether it finished.
    fn shutdown_and_wait(&self, timeout: Duration) -> Result<bool>;
}

/// Runs every invocation synchronously on the calling thread.
///
/// The default invoker, suitable for targets that are not thread-safe.
#[derive(Debug, Default)]
pub struct CurrentThreadInvoker {
    shut_down: AtomicBool,
}

impl CurrentThreadInvoker {
    /// Create an invoker.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Invoker for CurrentThreadInvoker {
    fn invoke(&self, harness: &Arc<Harness>, params: Vec<Param>, done: Completion) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::shutdown());
        }
        done(harness.execute(params));
        Ok(())
    }

    fn shutdown_and_wait(&self, _timeout: Duration) -> Result<bool> {
        self.shut_down.store(true, Ordering::Release);
        Ok(true)
    }
}

struct Job {
    harness: Arc<Harness>,
    params: Vec<Param>,
    done: Completion,
}

/// Runs invocations on a fixed set of worker threads.
///
/// Submission blocks while `capacity` jobs are already waiting.
pub struct ThreadPoolInvoker {
    jobs: Mutex<Option<Sender<Job>>>,
    exited: Receiver<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadPoolInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolInvoker")
            .field("workers", &crate::lock(&self.workers).len())
            .finish_non_exhaustive()
    }
}

impl ThreadPoolInvoker {
    /// Spawn `threads` workers (at least one) fed by a queue of `capacity`
    /// pending jobs.
    pub fn new(threads: usize, capacity: usize) -> Result<Self> {
        let (jobs, rx) = channel::bounded::<Job>(capacity);
        // Never sent on: every worker drops its sender on exit, so the channel
        // disconnects once all of them are done.
        let (exit_tx, exited) = channel::bounded::<()>(0);

        let mut workers = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = rx.clone();
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("covfuzz-worker-{i}"))
                .spawn(move || {
                    let _exit_tx = exit_tx;
                    for job in rx.iter() {
                        let Job {
                            harness,
                            params,
                            done,
                        } = job;
                        let result = harness.execute(params);
                        if panic::catch_unwind(AssertUnwindSafe(|| done(result))).is_err() {
                            log::error!("execution completion panicked on worker {i}");
                        }
                    }
                })?;
            workers.push(handle);
        }
        log::debug!("spawned {} invoker workers", workers.len());

        Ok(Self {
            jobs: Mutex::new(Some(jobs)),
            exited,
            workers: Mutex::new(workers),
        })
    }
}

impl Invoker for ThreadPoolInvoker {
    fn invoke(&self, harness: &Arc<Harness>, params: Vec<Param>, done: Completion) -> Result<()> {
        let jobs = crate::lock(&self.jobs).clone().ok_or_else(Error::shutdown)?;
        jobs.send(Job {
            harness: harness.clone(),
            params,
            done,
        })
        .map_err(|_| Error::shutdown())
    }

    fn shutdown_and_wait(&self, timeout: Duration) -> Result<bool> {
        crate::lock(&self.jobs).take();
        let deadline = Instant::now().checked_add(timeout);
        let drained = match deadline {
            Some(deadline) => self.exited.recv_deadline(deadline),
            None => self.exited.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match drained {
            Err(RecvTimeoutError::Disconnected) => {
                for handle in crate::lock(&self.workers).drain(..) {
                    if handle.join().is_err() {
                        log::error!("invoker worker panicked");
                    }
                }
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("invoker workers still busy after {timeout:?}");
                Ok(false)
            }
            Ok(()) => Err(Error::other("unexpected message from invoker worker")),
        }
    }
}

impl Drop for ThreadPoolInvoker {
    fn drop(&mut self) {
        crate::lock(&self.jobs).take();
    }
}
