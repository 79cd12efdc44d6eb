//! Tracers record the branches a thread takes while running a target.

use crate::{
    coverage::{RawEdge, RawTrace, Symbol, SymbolResolver},
    Result,
};
use dashmap::DashMap;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    thread::{self, ThreadId},
};

/// Records branch coverage for one thread at a time.
///
/// `start_trace` and `stop_trace` are called in pairs around every execution,
/// on the thread that runs it. Pairs for different threads may interleave.
pub trait Tracer: Send + Sync {
    /// Begin recording branches taken by `thread`.
    fn start_trace(&self, thread: ThreadId) -> Result<()>;

    /// Stop recording for `thread` and return what was recorded.
    fn stop_trace(&self, thread: ThreadId) -> Result<RawTrace>;
}

impl<T> Tracer for Arc<T>
where
    T: Tracer + ?Sized,
{
    fn start_trace(&self, thread: ThreadId) -> Result<()> {
        (**self).start_trace(thread)
    }

    fn stop_trace(&self, thread: ThreadId) -> Result<RawTrace> {
        (**self).stop_trace(thread)
    }
}

/// A tracer for hand-instrumented targets.
///
/// The target reports each branch it takes by calling [`ManualTracer::edge`]
/// or [`ManualTracer::branch`]; reports from threads that are not being
/// traced are ignored. Units are registered up front with
/// [`ManualTracer::unit`], which also makes the tracer a [`SymbolResolver`]
/// for the ids it hands out.
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::{coverage::SymbolResolver, tracer::{ManualTracer, Tracer}};
///
/// let tracer = ManualTracer::new();
/// let unit = tracer.unit("demo", "abs");
///
/// let abs = |x: i32| {
///     if x < 0 {
///         tracer.branch(unit, 0, 1);
///         -x
///     } else {
///         tracer.branch(unit, 0, 2);
///         x
///     }
/// };
///
/// let me = std::thread::current().id();
/// tracer.start_trace(me)?;
/// abs(-3);
/// abs(-4);
/// let trace = tracer.stop_trace(me)?;
///
/// let edges: Vec<_> = trace.edges().collect();
/// assert_eq!(edges.len(), 1);
/// assert_eq!(edges[0].hits, 2);
/// assert_eq!(tracer.resolve_unit(unit).unwrap().member, "abs");
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct ManualTracer {
    active: DashMap<ThreadId, HashMap<(i64, i64, i64, i64), u64>>,
    units: RwLock<Vec<Symbol>>,
}

impl ManualTracer {
    /// Create a tracer with no registered units.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit and return its id.
    pub fn unit(&self, unit: impl Into<String>, member: impl Into<String>) -> i64 {
        let symbol = Symbol::new(unit, member);
        let mut units = self.units.write().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = units.iter().position(|s| *s == symbol) {
            return id as i64;
        }
        units.push(symbol);
        units.len() as i64 - 1
    }

    /// Record that the current thread took an edge from `from_offset` in unit
    /// `from_id` to `to_offset` in unit `to_id`.
    pub fn edge(&self, from_id: i64, from_offset: i64, to_id: i64, to_offset: i64) {
        if let Some(mut edges) = self.active.get_mut(&thread::current().id()) {
            *edges
                .entry((from_id, from_offset, to_id, to_offset))
                .or_insert(0) += 1;
        }
    }

    /// Record a branch within a single unit.
    #[inline]
    pub fn branch(&self, unit: i64, from_offset: i64, to_offset: i64) {
        self.edge(unit, from_offset, unit, to_offset);
    }
}

impl Tracer for ManualTracer {
    fn start_trace(&self, thread: ThreadId) -> Result<()> {
        self.active.insert(thread, HashMap::new());
        Ok(())
    }

    fn stop_trace(&self, thread: ThreadId) -> Result<RawTrace> {
        let edges = self.active.remove(&thread).map(|(_, e)| e).unwrap_or_default();
        Ok(edges
            .into_iter()
            .map(|((from_id, from_offset, to_id, to_offset), hits)| RawEdge {
                from_id,
                from_offset,
                to_id,
                to_offset,
                hits,
            })
            .collect())
    }
}

impl SymbolResolver for ManualTracer {
    fn resolve_unit(&self, id: i64) -> Option<Symbol> {
        let units = self.units.read().unwrap_or_else(|e| e.into_inner());
        usize::try_from(id).ok().and_then(|i| units.get(i)).cloned()
    }
}
