use covfuzz::{
    invoke::{
        Completion, CurrentThreadInvoker, ExecutionResult, Failure, Harness, Invoker, Outcome,
        Target, ThreadPoolInvoker,
    },
    tracer::ManualTracer,
    Param, Value, ValueKind,
};
use crossbeam::channel;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn int(x: i32) -> Vec<Param> {
    vec![Param::from(Value::I32(x))]
}

/// A harness whose target branches on its argument and counts its calls.
fn counting_harness() -> (Arc<Harness>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let tracer = Arc::new(ManualTracer::new());
    let unit = tracer.unit("tests", "classify");
    let target = {
        let calls = calls.clone();
        let tracer = tracer.clone();
        Target::new("classify", vec![ValueKind::I32], move |args| {
            calls.fetch_add(1, Ordering::SeqCst);
            match args {
                [Value::I32(0)] => {
                    tracer.branch(unit, 0, 1);
                    Err("zero".into())
                }
                [Value::I32(x)] if *x < 0 => {
                    tracer.branch(unit, 0, 2);
                    panic!("negative: {x}")
                }
                [Value::I32(x)] => {
                    tracer.branch(unit, 0, 3);
                    tracer.branch(unit, 3, 4);
                    Ok(Value::I32(x * 2))
                }
                _ => Err("bad arguments".into()),
            }
        })
    };
    (Arc::new(Harness::new(target, tracer.clone(), tracer)), calls)
}

#[test]
fn execute_traces_and_returns() -> anyhow::Result<()> {
    init_logger();
    let (harness, _) = counting_harness();
    let result = harness.execute(int(21))?;
    assert_eq!(result.outcome, Outcome::Ok(Value::I32(42)));
    assert_eq!(result.trace.branches().len(), 2);
    assert_eq!(result.params.len(), 1);
    Ok(())
}

#[test]
fn execute_records_failures() -> anyhow::Result<()> {
    init_logger();
    let (harness, _) = counting_harness();

    let raised = harness.execute(int(0))?;
    assert_eq!(raised.outcome.failure(), Some(&Failure::Raised("zero".into())));
    assert_eq!(raised.trace.branches().len(), 1);

    let panicked = harness.execute(int(-3))?;
    assert_eq!(
        panicked.outcome.failure(),
        Some(&Failure::Panic("negative: -3".into()))
    );
    // The trace still covers what ran before the panic.
    assert_eq!(panicked.trace.branches().len(), 1);
    assert_ne!(
        raised.trace.stable_hash(true),
        panicked.trace.stable_hash(true)
    );
    Ok(())
}

#[test]
fn mismatched_params_never_reach_the_target() -> anyhow::Result<()> {
    let (harness, calls) = counting_harness();
    let result = harness.execute(vec![Param::from(Value::Bool(true))])?;
    assert_eq!(
        result.outcome.failure(),
        Some(&Failure::SignatureMismatch {
            expected: vec![ValueKind::I32],
            actual: vec![ValueKind::Bool],
        })
    );
    assert!(result.trace.branches().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    Ok(())
}

fn collect_into(results: &Arc<Mutex<Vec<ExecutionResult>>>) -> Completion {
    let results = results.clone();
    Box::new(move |result: covfuzz::Result<ExecutionResult>| {
        results.lock().unwrap().push(result.unwrap())
    })
}

#[test]
fn current_thread_invoker_runs_inline() -> anyhow::Result<()> {
    let (harness, calls) = counting_harness();
    let invoker = CurrentThreadInvoker::new();
    let results = Arc::new(Mutex::new(Vec::new()));

    invoker.invoke(&harness, int(1), collect_into(&results))?;
    assert_eq!(results.lock().unwrap().len(), 1);

    assert!(invoker.shutdown_and_wait(Duration::ZERO)?);
    let err = invoker
        .invoke(&harness, int(2), collect_into(&results))
        .unwrap_err();
    assert!(err.is_shutdown());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn thread_pool_finishes_dispatched_work() -> anyhow::Result<()> {
    init_logger();
    let (harness, calls) = counting_harness();
    let invoker = ThreadPoolInvoker::new(4, 2)?;
    let results = Arc::new(Mutex::new(Vec::new()));

    for x in 1..=100 {
        invoker.invoke(&harness, int(x), collect_into(&results))?;
    }
    assert!(invoker.shutdown_and_wait(Duration::from_secs(60))?);
    assert_eq!(calls.load(Ordering::SeqCst), 100);

    let mut doubled: Vec<_> = results
        .lock()
        .unwrap()
        .iter()
        .map(|r| match r.outcome {
            Outcome::Ok(Value::I32(x)) => x,
            ref other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    doubled.sort_unstable();
    assert_eq!(doubled, (1..=100).map(|x| x * 2).collect::<Vec<_>>());

    let err = invoker
        .invoke(&harness, int(1), collect_into(&results))
        .unwrap_err();
    assert!(err.is_shutdown());
    Ok(())
}

#[test]
fn thread_pool_shutdown_times_out_on_busy_workers() -> anyhow::Result<()> {
    init_logger();
    let (release, released) = channel::bounded::<()>(0);
    let tracer = Arc::new(ManualTracer::new());
    let target = Target::new("blocked", vec![ValueKind::Unit], move |_| {
        let _ = released.recv();
        Ok(Value::Unit)
    });
    let harness = Arc::new(Harness::new(target, tracer.clone(), tracer));
    let invoker = ThreadPoolInvoker::new(1, 1)?;

    let done = Arc::new(AtomicUsize::new(0));
    let completion: Completion = {
        let done = done.clone();
        Box::new(move |_: covfuzz::Result<ExecutionResult>| {
            done.fetch_add(1, Ordering::SeqCst);
        })
    };
    invoker.invoke(&harness, vec![Param::from(Value::Unit)], completion)?;

    assert!(!invoker.shutdown_and_wait(Duration::from_millis(20))?);
    assert_eq!(done.load(Ordering::SeqCst), 0);

    drop(release);
    assert!(invoker.shutdown_and_wait(Duration::from_secs(60))?);
    assert_eq!(done.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn a_panicking_completion_does_not_kill_the_worker() -> anyhow::Result<()> {
    init_logger();
    let (harness, calls) = counting_harness();
    let invoker = ThreadPoolInvoker::new(1, 4)?;
    let exploding: Completion =
        Box::new(|_: covfuzz::Result<ExecutionResult>| panic!("completion failed"));
    invoker.invoke(&harness, int(1), exploding)?;

    let (tx, rx) = channel::bounded(1);
    invoker.invoke(
        &harness,
        int(2),
        Box::new(move |result: covfuzz::Result<ExecutionResult>| {
            let _ = tx.send(result.map(|r| r.outcome));
        }),
    )?;
    let outcome = rx.recv_timeout(Duration::from_secs(60))??;
    assert_eq!(outcome, Outcome::Ok(Value::I32(4)));
    assert!(invoker.shutdown_and_wait(Duration::from_secs(60))?);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}
