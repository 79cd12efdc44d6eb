use covfuzz::{
    cache::CoverageCache,
    coverage::{ResolvedBranch, Symbol, TraceResult},
    invoke::{ExecutionResult, Outcome},
    mutators::Tweak,
    queue::{InputQueue, QueueEntry, TestCase},
    ByteArrayConfig, ByteArrayGenerator, Limits, MutationConfig, Param, ParamGen, Value,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn trace(offsets: &[i64]) -> Arc<TraceResult> {
    let unit = Arc::new(Symbol::new("app", "parse"));
    Arc::new(TraceResult::from_branches(
        offsets
            .iter()
            .map(|&o| ResolvedBranch {
                from: Some(unit.clone()),
                from_offset: o,
                to: Some(unit.clone()),
                to_offset: o + 1,
                hits: 1,
            })
            .collect(),
    ))
}

fn result(param: Param, offsets: &[i64]) -> ExecutionResult {
    ExecutionResult {
        params: vec![param],
        trace: trace(offsets),
        outcome: Outcome::Ok(Value::Unit),
        nanos: 1_000,
    }
}

/// A queue that never holds anything and records whether it was closed.
#[derive(Default)]
struct NullQueue {
    closed: Arc<AtomicBool>,
}

impl InputQueue for NullQueue {
    fn enqueue(&self, _: TestCase) -> covfuzz::Result<()> {
        Ok(())
    }

    fn cull_and_dequeue(&self) -> covfuzz::Result<Option<QueueEntry>> {
        Ok(None)
    }

    fn len(&self) -> usize {
        0
    }

    fn close(&self) -> covfuzz::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Err(covfuzz::Error::other("queue close failed"))
    }
}

struct FailingCache {
    closed: Arc<AtomicBool>,
}

impl CoverageCache for FailingCache {
    fn check_unique_and_store(&self, _: u64) -> covfuzz::Result<bool> {
        Ok(true)
    }

    fn len(&self) -> usize {
        0
    }

    fn close(&self) -> covfuzz::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Err(covfuzz::Error::corrupt("cache close failed"))
    }
}

#[test]
fn novel_coverage_is_enqueued_once() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"ab".to_vec()])
            .seed(1),
    )?);
    assert_eq!(gen.queue().len(), 1);

    let param = gen.clone().values().next().unwrap();
    let entry = param.entry().unwrap().clone();
    assert_eq!(entry.dequeued_index(), 0);
    assert!(gen.queue().is_empty());

    gen.on_result(&result(param.clone(), &[1, 2]), 0)?;
    assert_eq!(gen.queue().len(), 1);
    assert_eq!(gen.cache().len(), 1);

    // Same path again: nothing new to learn.
    gen.on_result(&result(param.clone(), &[2, 1]), 0)?;
    assert_eq!(gen.queue().len(), 1);

    gen.on_result(&result(param, &[3]), 0)?;
    assert_eq!(gen.queue().len(), 2);
    assert_eq!(gen.cache().len(), 2);

    let stats = gen.stats();
    assert_eq!(stats.result_count, 3);
    assert_eq!(stats.branch_count, 5);
    assert_eq!(stats.total_nanos, 3_000);
    assert_eq!(entry.stats().result_count, 3);
    assert_eq!(entry.stats().total_branch_count, 5);
    Ok(())
}

#[test]
fn enqueued_seeds_are_mutated_next() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"a".to_vec()])
            .mutation(MutationConfig::default().havoc_cycles(4))
            .seed(2),
    )?);
    let mut values = gen.clone().values();

    assert!(values.next().is_some());
    let novel = Param::from(Value::Bytes(b"novel".to_vec()));
    gen.on_result(&result(novel, &[7]), 0)?;

    // Drain the current batch; the next one starts from the new seed.
    let next = values
        .find(|p| p.entry().unwrap().dequeued_index() != 0)
        .unwrap();
    assert_eq!(next.entry().unwrap().dequeued_index(), 1);
    assert_eq!(&next.entry().unwrap().bytes()[..], b"novel");
    assert_eq!(next.value().as_bytes().unwrap().len(), 5);
    Ok(())
}

#[test]
fn feedback_for_other_kinds_is_not_enqueued() -> anyhow::Result<()> {
    let gen = ByteArrayGenerator::new(ByteArrayConfig::default().initial_values(vec![]))?;
    gen.on_result(&result(Param::from(Value::I32(3)), &[1]), 0)?;
    assert_eq!(gen.cache().len(), 1);
    assert!(gen.queue().is_empty());

    // An index past the tuple only updates statistics.
    gen.on_result(&result(Param::from(Value::I32(3)), &[9]), 4)?;
    assert_eq!(gen.cache().len(), 1);
    assert_eq!(gen.stats().result_count, 2);
    Ok(())
}

#[test]
fn empty_queue_falls_back_to_havoc_over_the_last_seed() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"a".to_vec()])
            .mutation(MutationConfig::default().havoc_cycles(8))
            .seed(3),
    )?);
    let candidates: Vec<_> = gen.clone().values().take(1000).collect();
    assert_eq!(candidates.len(), 1000);
    for c in &candidates {
        assert_eq!(c.entry().unwrap().dequeued_index(), 0);
        assert_ne!(c.value().as_bytes(), Some(&b"a"[..]));
    }
    assert!(gen.stats().queue_cycle >= 1);
    Ok(())
}

#[test]
fn never_dequeued_falls_back_to_initial_values() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"x".to_vec(), b"y".to_vec()])
            .queue(|| Ok(Box::new(NullQueue::default()))),
    )?);

    let got: Vec<_> = gen
        .clone()
        .values()
        .take(4)
        .map(|p| (p.value().clone(), p.entry().unwrap().dequeued_index()))
        .collect();
    assert_eq!(
        got,
        [
            (Value::Bytes(b"x".to_vec()), -2),
            (Value::Bytes(b"y".to_vec()), -1),
            (Value::Bytes(b"x".to_vec()), -2),
            (Value::Bytes(b"y".to_vec()), -1),
        ]
    );
    // Nothing was ever dequeued.
    assert_eq!(gen.stats().queue_cycle, 0);
    Ok(())
}

#[test]
fn nothing_to_yield_ends_the_stream_at_the_limit() -> anyhow::Result<()> {
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![])
            .max_empty_batches(16)
            .queue(|| Ok(Box::new(NullQueue::default()))),
    )?);
    assert!(gen.clone().values().next().is_none());
    Ok(())
}

#[test]
fn closing_ends_an_idle_stream() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![])
            .queue(|| Ok(Box::new(NullQueue::default()))),
    )?);
    let closer = {
        let gen = gen.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            gen.close()
        })
    };
    assert!(gen.clone().values().next().is_none());
    // The null queue reports a close failure, but the stream still ends.
    assert!(closer.join().unwrap().is_err());
    Ok(())
}

#[test]
fn queue_cycle_counts_dequeues() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
            .mutation(MutationConfig::default().havoc_cycles(4))
            .seed(5),
    )?);
    let mut values = gen.clone().values();
    let mut last = -1;
    while last < 2 {
        last = values.next().unwrap().entry().unwrap().dequeued_index();
        assert_eq!(gen.stats().queue_cycle, last as u64 + 1);
    }
    assert!(gen.queue().is_empty());
    Ok(())
}

#[test]
fn havoc_blocks_widen_with_each_dequeue() -> anyhow::Result<()> {
    init_logger();
    const LEN: usize = 200;
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![vec![0; LEN]; 4])
            .mutation(
                MutationConfig::default()
                    .havoc_cycles(200)
                    .havoc_stack_power(0)
                    .tweaks(vec![Tweak::DeleteBytes]),
            )
            .warmup(Duration::ZERO)
            .seed(11),
    )?);
    let block_small = Limits::default().block_small;

    // Only havoc changes the length. Each havoc candidate deletes two blocks.
    // The fourth seed is only there to end the loop.
    let mut shortest = [LEN; 3];
    for param in gen.clone().values() {
        let index = param.entry().unwrap().dequeued_index();
        if index > 2 {
            break;
        }
        let len = param.value().as_bytes().unwrap().len();
        shortest[index as usize] = shortest[index as usize].min(len);
    }

    // The first seed only gets the smallest tier.
    assert!(shortest[0] >= LEN - 2 * block_small, "{shortest:?}");
    assert!(shortest[0] < LEN);
    // By the third, deletions reach past it.
    assert!(shortest[2] < LEN - 2 * block_small, "{shortest:?}");
    Ok(())
}

#[test]
fn close_closes_queue_and_cache() -> anyhow::Result<()> {
    init_logger();
    let queue_closed = Arc::new(AtomicBool::new(false));
    let cache_closed = Arc::new(AtomicBool::new(false));
    let gen = ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .queue({
                let closed = queue_closed.clone();
                move || -> covfuzz::Result<Box<dyn InputQueue>> {
                    Ok(Box::new(NullQueue {
                        closed: closed.clone(),
                    }))
                }
            })
            .cache({
                let closed = cache_closed.clone();
                move || -> covfuzz::Result<Box<dyn CoverageCache>> {
                    Ok(Box::new(FailingCache {
                        closed: closed.clone(),
                    }))
                }
            }),
    )?;

    // Both fail; the queue's error is reported.
    let err = gen.close().unwrap_err();
    assert!(err.is_other(), "{err}");
    assert!(queue_closed.load(Ordering::SeqCst));
    assert!(cache_closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn failed_cache_creation_closes_the_queue() -> anyhow::Result<()> {
    let queue_closed = Arc::new(AtomicBool::new(false));
    let err = ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .queue({
                let closed = queue_closed.clone();
                move || -> covfuzz::Result<Box<dyn InputQueue>> {
                    Ok(Box::new(NullQueue {
                        closed: closed.clone(),
                    }))
                }
            })
            .cache(|| Err(covfuzz::Error::corrupt("bad cache file"))),
    )
    .unwrap_err();
    assert!(err.is_corrupt());
    assert!(queue_closed.load(Ordering::SeqCst));
    Ok(())
}

#[test]
fn dictionary_tokens_are_used() -> anyhow::Result<()> {
    init_logger();
    let gen = Arc::new(ByteArrayGenerator::new(
        ByteArrayConfig::default()
            .initial_values(vec![b"........".to_vec()])
            .dictionary(vec![b"GIF".to_vec(), b"GIF".to_vec(), b"89a".to_vec()])
            .mutation(MutationConfig::default().havoc_cycles(0))
            .seed(4),
    )?);
    let candidates: Vec<Vec<u8>> = gen
        .clone()
        .values()
        .take_while(|p| p.entry().unwrap().dequeued_index() == 0)
        .map(|p| p.value().as_bytes().unwrap().to_vec())
        .collect();
    assert!(candidates.contains(&b"GIF.....".to_vec()));
    assert!(candidates.contains(&b".....89a".to_vec()));
    let gif_first = candidates.iter().filter(|c| c.starts_with(b"GIF")).count();
    assert_eq!(gif_first, 1);
    Ok(())
}
