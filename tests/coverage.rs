use covfuzz::{
    coverage::{CachedResolver, RawEdge, RawTrace, Symbol, SymbolResolver, TraceResult},
    tracer::{ManualTracer, Tracer},
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Resolves ids `0..names.len()` and counts how often it is asked.
struct Names {
    names: Vec<&'static str>,
    lookups: AtomicUsize,
}

impl Names {
    fn new(names: &[&'static str]) -> Self {
        Self {
            names: names.to_vec(),
            lookups: AtomicUsize::new(0),
        }
    }
}

impl SymbolResolver for Names {
    fn resolve_unit(&self, id: i64) -> Option<Symbol> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let name = usize::try_from(id).ok().and_then(|i| self.names.get(i))?;
        Some(Symbol::new("app", *name))
    }
}

fn edge(from_id: i64, from_offset: i64, to_id: i64, to_offset: i64, hits: u64) -> RawEdge {
    RawEdge {
        from_id,
        from_offset,
        to_id,
        to_offset,
        hits,
    }
}

#[test]
fn fingerprint_ignores_edge_order() -> anyhow::Result<()> {
    init_logger();
    let names = Names::new(&["main", "parse", "emit"]);
    let edges = vec![
        edge(0, 1, 1, 0, 1),
        edge(1, 4, 1, 9, 3),
        edge(1, 12, 2, 0, 1),
        edge(2, 7, 0, 3, 20),
    ];
    let forward = TraceResult::resolve(&RawTrace::new(edges.clone()), &names);

    let mut shuffled = edges;
    shuffled.reverse();
    shuffled.swap(0, 2);
    let backward = TraceResult::resolve(&RawTrace::new(shuffled), &names);

    assert_eq!(forward.stable_hash(true), backward.stable_hash(true));
    assert_eq!(forward.stable_hash(false), backward.stable_hash(false));
    assert_ne!(forward.branch_hashes(true), backward.branch_hashes(true));
    Ok(())
}

#[test]
fn fingerprint_ignores_unit_ids() -> anyhow::Result<()> {
    // Two processes assigning different ids to the same units agree on the
    // path.
    let first = Names::new(&["main", "parse"]);
    let second = Names::new(&["parse", "main"]);
    let a = TraceResult::resolve(&RawTrace::new(vec![edge(0, 5, 1, 0, 1)]), &first);
    let b = TraceResult::resolve(&RawTrace::new(vec![edge(1, 5, 0, 0, 1)]), &second);
    assert_eq!(a.stable_hash(true), b.stable_hash(true));
    Ok(())
}

#[test]
fn sentinels_are_discarded() -> anyhow::Result<()> {
    let names = Names::new(&["main"]);
    let real = edge(0, 1, 0, 2, 1);
    let with_sentinels = RawTrace::new(vec![RawEdge::SENTINEL, real, RawEdge::SENTINEL]);
    assert_eq!(with_sentinels.edges().count(), 1);

    let a = TraceResult::resolve(&with_sentinels, &names);
    let b = TraceResult::resolve(&RawTrace::new(vec![real]), &names);
    assert_eq!(a.branches().len(), 1);
    assert_eq!(a.stable_hash(true), b.stable_hash(true));

    let empty = TraceResult::resolve(&RawTrace::new(vec![RawEdge::SENTINEL]), &names);
    assert!(empty.branches().is_empty());
    assert_eq!(empty.stable_hash(true), TraceResult::default().stable_hash(true));
    Ok(())
}

#[test]
fn hit_counts_are_bucketed() -> anyhow::Result<()> {
    let names = Names::new(&["main"]);
    let with_hits = |hits| {
        TraceResult::resolve(&RawTrace::new(vec![edge(0, 1, 0, 2, hits)]), &names)
    };

    assert_eq!(with_hits(9).stable_hash(true), with_hits(12).stable_hash(true));
    assert_ne!(with_hits(3).stable_hash(true), with_hits(4).stable_hash(true));
    assert_ne!(with_hits(1).stable_hash(true), with_hits(2).stable_hash(true));
    assert_eq!(with_hits(200).stable_hash(true), with_hits(5000).stable_hash(true));

    // Without hits, only the set of branches matters.
    assert_eq!(with_hits(1).stable_hash(false), with_hits(1000).stable_hash(false));
    Ok(())
}

#[test]
fn unresolvable_units_still_hash() -> anyhow::Result<()> {
    let names = Names::new(&["main"]);
    let trace = TraceResult::resolve(
        &RawTrace::new(vec![edge(0, 1, 7, 0, 1), edge(0, 1, 8, 1, 1)]),
        &names,
    );
    assert!(trace.branches().iter().all(|b| b.to.is_none()));
    assert!(trace.branches().iter().all(|b| b.from.is_some()));
    assert_eq!(trace.branch_hashes(true).len(), 2);
    assert_ne!(trace.branch_hashes(true)[0], trace.branch_hashes(true)[1]);
    assert_eq!(trace.branches()[0].to_string(), "from app::main(1) to ?(0) - 1 hits");
    Ok(())
}

#[test]
fn resolution_is_cached() -> anyhow::Result<()> {
    init_logger();
    let names = Arc::new(Names::new(&["main", "parse"]));
    let cached = CachedResolver::new(names.clone());
    let raw = RawTrace::new(vec![edge(0, 1, 1, 0, 1), edge(1, 3, 0, 2, 1), edge(-5, 0, 0, 0, 1)]);

    let first = TraceResult::resolve(&raw, &cached);
    let second = TraceResult::resolve(&raw, &cached);
    assert_eq!(first.stable_hash(true), second.stable_hash(true));
    // Negative ids never reach the wrapped resolver.
    assert_eq!(names.lookups.load(Ordering::SeqCst), 2);
    assert!(first.branches()[2].from.is_none());
    Ok(())
}

#[test]
fn filtered_keeps_matching_branches() -> anyhow::Result<()> {
    let names = Names::new(&["main", "log"]);
    let trace = TraceResult::resolve(
        &RawTrace::new(vec![edge(0, 1, 0, 2, 1), edge(1, 0, 1, 1, 1)]),
        &names,
    );
    let main_only = trace.filtered(|b| b.from.as_ref().is_some_and(|s| s.member == "main"));
    assert_eq!(main_only.branches().len(), 1);
    assert_ne!(main_only.stable_hash(true), trace.stable_hash(true));
    Ok(())
}

#[test]
fn manual_tracer_records_per_thread() -> anyhow::Result<()> {
    init_logger();
    let tracer = Arc::new(ManualTracer::new());
    let unit = tracer.unit("app", "work");
    assert_eq!(tracer.unit("app", "work"), unit);

    // Branches outside a trace are dropped.
    tracer.branch(unit, 0, 1);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let tracer = tracer.clone();
            std::thread::spawn(move || -> covfuzz::Result<RawTrace> {
                let me = std::thread::current().id();
                tracer.start_trace(me)?;
                for _ in 0..=i {
                    tracer.branch(unit, i, i + 1);
                }
                tracer.stop_trace(me)
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let trace = handle.join().expect("tracing thread panicked")?;
        let edges: Vec<_> = trace.edges().collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].from_offset, i as i64);
        assert_eq!(edges[0].hits, i as u64 + 1);
    }

    let me = std::thread::current().id();
    assert_eq!(tracer.stop_trace(me)?.edges().count(), 0);
    Ok(())
}
