//! Branch coverage: raw traces, symbol resolution, and stable fingerprints.
//!
//! A [`RawTrace`] is what a [`Tracer`][crate::tracer::Tracer] records for one
//! execution: a list of control-flow edges keyed by transient unit ids. A
//! [`TraceResult`] resolves those ids to symbol names so that every edge can
//! be hashed stably across runs and processes, and the whole trace condensed
//! into a single order-independent fingerprint.

use dashmap::DashMap;
use std::{
    collections::HashMap,
    fmt,
    hash::Hasher,
    sync::{Arc, OnceLock},
};
use twox_hash::XxHash64;

/// A single recorded control-flow edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawEdge {
    /// The unit (function, method, ...) the edge leaves.
    pub from_id: i64,
    /// The location within `from_id` the edge leaves from.
    pub from_offset: i64,
    /// The unit the edge enters.
    pub to_id: i64,
    /// The location within `to_id` the edge enters at.
    pub to_offset: i64,
    /// How many times the edge was taken.
    pub hits: u64,
}

impl RawEdge {
    /// A placeholder tuple that does not describe a real branch.
    pub const SENTINEL: RawEdge = RawEdge {
        from_id: -1,
        from_offset: -1,
        to_id: -1,
        to_offset: -1,
        hits: 0,
    };

    /// Whether this tuple is a placeholder rather than a real branch.
    #[inline]
    pub fn is_sentinel(&self) -> bool {
        self.from_id == -1 && self.from_offset == -1
    }
}

/// The edges recorded for one execution, in whatever order the tracer
/// produced them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawTrace {
    edges: Vec<RawEdge>,
}

impl RawTrace {
    /// Create a trace from recorded edges, sentinels included.
    pub fn new(edges: Vec<RawEdge>) -> Self {
        Self { edges }
    }

    /// The real branches in this trace, with sentinel tuples discarded.
    pub fn edges(&self) -> impl Iterator<Item = &RawEdge> + '_ {
        self.edges.iter().filter(|e| !e.is_sentinel())
    }
}

impl FromIterator<RawEdge> for RawTrace {
    fn from_iter<I: IntoIterator<Item = RawEdge>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Coarsen a hit count into one of a few buckets, so that loops running a
/// slightly different number of times do not count as distinct paths.
///
/// Counts of one to three are kept exactly; larger counts fall into the bands
/// `4..=7`, `8..=15`, `16..=31`, `32..=127`, and `128..`, each represented by
/// its lower bound. Zero maps to zero.
///
/// ```
/// use covfuzz::coverage::hit_bucket;
///
/// assert_ne!(hit_bucket(3), hit_bucket(4));
/// assert_eq!(hit_bucket(9), hit_bucket(12));
/// assert_eq!(hit_bucket(u64::MAX), 128);
/// ```
pub fn hit_bucket(hits: u64) -> u64 {
    match hits {
        0..=3 => hits,
        4..=7 => 4,
        8..=15 => 8,
        16..=31 => 16,
        32..=127 => 32,
        _ => 128,
    }
}

/// The stable name of a unit: its enclosing scope and its own name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// The enclosing scope, e.g. a module or type path.
    pub unit: String,
    /// The unit's own name.
    pub member: String,
}

impl Symbol {
    /// Create a new symbol.
    pub fn new(unit: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.unit, self.member)
    }
}

/// Resolves the transient unit ids in raw edges to stable symbols.
///
/// Implementations must be pure lookups and return `None` for unknown and
/// negative ids rather than failing.
pub trait SymbolResolver: Send + Sync {
    /// Resolve a unit id.
    fn resolve_unit(&self, id: i64) -> Option<Symbol>;
}

impl<R> SymbolResolver for Arc<R>
where
    R: SymbolResolver + ?Sized,
{
    fn resolve_unit(&self, id: i64) -> Option<Symbol> {
        (**self).resolve_unit(id)
    }
}

/// A [`SymbolResolver`] that remembers every resolution of the resolver it
/// wraps, across traces and threads.
#[derive(Debug)]
pub struct CachedResolver<R> {
    inner: R,
    cache: DashMap<i64, Option<Symbol>>,
}

impl<R: SymbolResolver> CachedResolver<R> {
    /// Wrap `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }
}

impl<R: SymbolResolver> SymbolResolver for CachedResolver<R> {
    fn resolve_unit(&self, id: i64) -> Option<Symbol> {
        if id < 0 {
            return None;
        }
        self.cache
            .entry(id)
            .or_insert_with(|| self.inner.resolve_unit(id))
            .value()
            .clone()
    }
}

/// A branch whose endpoints have been resolved to symbols.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBranch {
    /// The symbol the edge leaves, if it could be resolved.
    pub from: Option<Arc<Symbol>>,
    /// The location within `from`.
    pub from_offset: i64,
    /// The symbol the edge enters, if it could be resolved.
    pub to: Option<Arc<Symbol>>,
    /// The location within `to`.
    pub to_offset: i64,
    /// How many times the edge was taken.
    pub hits: u64,
}

impl ResolvedBranch {
    /// A hash of this branch that is stable across runs and processes.
    ///
    /// Covers both endpoint names and offsets and, when `include_hits` is set,
    /// the [`hit_bucket`] of the hit count.
    pub fn stable_hash(&self, include_hits: bool) -> u64 {
        let mut h = XxHash64::with_seed(0);
        write_symbol(&mut h, self.from.as_deref());
        h.write(&self.from_offset.to_le_bytes());
        write_symbol(&mut h, self.to.as_deref());
        h.write(&self.to_offset.to_le_bytes());
        let bucket = if include_hits { hit_bucket(self.hits) } else { 0 };
        h.write(&bucket.to_le_bytes());
        h.finish()
    }
}

fn write_symbol(h: &mut XxHash64, symbol: Option<&Symbol>) {
    match symbol {
        Some(s) => {
            h.write_u8(1);
            h.write(s.unit.as_bytes());
            h.write_u8(0xff);
            h.write(s.member.as_bytes());
            h.write_u8(0xff);
        }
        None => h.write_u8(0),
    }
}

impl fmt::Display for ResolvedBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |s: &Option<Arc<Symbol>>| match s {
            Some(s) => s.to_string(),
            None => "?".to_string(),
        };
        write!(
            f,
            "from {}({}) to {}({}) - {} hits",
            name(&self.from),
            self.from_offset,
            name(&self.to),
            self.to_offset,
            self.hits
        )
    }
}

/// Hash a list of per-branch hashes into a single fingerprint, independent of
/// the list's order.
///
/// ```
/// use covfuzz::coverage::fingerprint;
///
/// assert_eq!(fingerprint(&[3, 1, 2]), fingerprint(&[1, 2, 3]));
/// assert_ne!(fingerprint(&[1, 2]), fingerprint(&[1, 2, 3]));
/// ```
pub fn fingerprint(branch_hashes: &[u64]) -> u64 {
    let mut sorted = branch_hashes.to_vec();
    sorted.sort_unstable();
    let mut h = XxHash64::with_seed(0);
    for v in sorted {
        h.write(&v.to_le_bytes());
    }
    h.finish()
}

/// The resolved coverage of one execution.
#[derive(Debug, Default)]
pub struct TraceResult {
    branches: Vec<ResolvedBranch>,
    with_hits: OnceLock<Vec<u64>>,
    without_hits: OnceLock<Vec<u64>>,
}

impl Clone for TraceResult {
    fn clone(&self) -> Self {
        Self::from_branches(self.branches.clone())
    }
}

impl TraceResult {
    /// Resolve the real branches of `raw` through `resolver`.
    ///
    /// Each unit id is looked up at most once per trace.
    pub fn resolve(raw: &RawTrace, resolver: &dyn SymbolResolver) -> Self {
        let mut seen: HashMap<i64, Option<Arc<Symbol>>> = HashMap::new();
        let mut lookup = |id: i64| {
            seen.entry(id)
                .or_insert_with(|| {
                    if id < 0 {
                        None
                    } else {
                        resolver.resolve_unit(id).map(Arc::new)
                    }
                })
                .clone()
        };
        let branches = raw
            .edges()
            .map(|e| ResolvedBranch {
                from: lookup(e.from_id),
                from_offset: e.from_offset,
                to: lookup(e.to_id),
                to_offset: e.to_offset,
                hits: e.hits,
            })
            .collect();
        Self::from_branches(branches)
    }

    /// Create a trace result from already-resolved branches.
    pub fn from_branches(branches: Vec<ResolvedBranch>) -> Self {
        Self {
            branches,
            with_hits: OnceLock::new(),
            without_hits: OnceLock::new(),
        }
    }

    /// The resolved branches, in trace order.
    pub fn branches(&self) -> &[ResolvedBranch] {
        &self.branches
    }

    /// A new trace result containing only the branches matching `pred`.
    pub fn filtered(&self, mut pred: impl FnMut(&ResolvedBranch) -> bool) -> Self {
        Self::from_branches(self.branches.iter().filter(|b| pred(b)).cloned().collect())
    }

    /// The stable hash of every branch, in trace order.
    pub fn branch_hashes(&self, include_hits: bool) -> &[u64] {
        let cell = if include_hits {
            &self.with_hits
        } else {
            &self.without_hits
        };
        cell.get_or_init(|| {
            self.branches
                .iter()
                .map(|b| b.stable_hash(include_hits))
                .collect()
        })
    }

    /// The fingerprint of this execution's path.
    ///
    /// Two executions with the same fingerprint are considered to have taken
    /// the same path. With `include_hits` unset, executions that only differ
    /// in how often they took each branch share a fingerprint.
    pub fn stable_hash(&self, include_hits: bool) -> u64 {
        fingerprint(self.branch_hashes(include_hits))
    }
}
