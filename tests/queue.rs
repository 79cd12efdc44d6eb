use covfuzz::queue::{InMemoryQueue, InputQueue, TestCase};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn dequeue_bytes(queue: &impl InputQueue) -> anyhow::Result<Option<Vec<u8>>> {
    Ok(queue.cull_and_dequeue()?.map(|e| e.bytes().to_vec()))
}

#[test]
fn favored_cases_come_first() -> anyhow::Result<()> {
    init_logger();
    let a = TestCase::new(b"a".to_vec());
    let b = TestCase::executed(b"b".to_vec(), vec![1, 2], 10);
    let c = TestCase::executed(b"c".to_vec(), vec![2, 3], 20);

    let culled = TestCase::culled(vec![a.clone(), b.clone(), c.clone()]);
    assert_eq!(culled, [b, c, a]);
    Ok(())
}

#[test]
fn redundant_cases_are_not_favored() -> anyhow::Result<()> {
    // `slow` covers nothing `fast` does not, so it drops behind `novel`.
    let fast = TestCase::executed(b"fast".to_vec(), vec![1, 2, 3], 1);
    let slow = TestCase::executed(b"slow".to_vec(), vec![2, 3], 100);
    let unrun = TestCase::new(b"x".to_vec());
    let novel = TestCase::executed(b"novel".to_vec(), vec![4], 1000);

    let culled = TestCase::culled(vec![unrun.clone(), slow.clone(), novel.clone(), fast.clone()]);
    assert_eq!(culled, [fast, novel, slow, unrun]);
    Ok(())
}

#[test]
fn score_is_length_times_duration() -> anyhow::Result<()> {
    assert_eq!(TestCase::executed(b"abcd".to_vec(), vec![], 25).score(), Some(100));
    assert_eq!(TestCase::new(b"abcd".to_vec()).score(), None);
    Ok(())
}

#[test]
fn dequeue_indices_count_up() -> anyhow::Result<()> {
    init_logger();
    let queue = InMemoryQueue::new();
    assert!(queue.cull_and_dequeue()?.is_none());

    for i in 0..5u8 {
        queue.enqueue(TestCase::new(vec![i]))?;
    }
    assert_eq!(queue.len(), 5);

    for expected in 0..5 {
        let entry = queue.cull_and_dequeue()?.unwrap();
        assert_eq!(entry.dequeued_index(), expected);
        assert_eq!(entry.stats().result_count, 0);
    }
    assert!(queue.is_empty());
    assert!(queue.cull_and_dequeue()?.is_none());

    queue.enqueue(TestCase::new(vec![9]))?;
    assert_eq!(queue.cull_and_dequeue()?.unwrap().dequeued_index(), 5);
    Ok(())
}

#[test]
fn recovered_queues_continue_their_indices() -> anyhow::Result<()> {
    let queue = InMemoryQueue::with_cases(vec![
        TestCase::new(b"x".to_vec()),
        TestCase::executed(b"y".to_vec(), vec![1], 5),
    ]);
    let entry = queue.cull_and_dequeue()?.unwrap();
    assert_eq!(&entry.bytes()[..], b"y");
    assert_eq!(entry.dequeued_index(), 2);
    Ok(())
}

#[test]
fn culls_only_after_an_enqueue() -> anyhow::Result<()> {
    init_logger();
    let queue = InMemoryQueue::new();
    queue.enqueue(TestCase::new(b"a".to_vec()))?;
    queue.enqueue(TestCase::executed(b"d".to_vec(), vec![2, 3], 30))?;
    queue.enqueue(TestCase::executed(b"c".to_vec(), vec![2], 20))?;
    queue.enqueue(TestCase::executed(b"b".to_vec(), vec![1, 2], 10))?;

    assert_eq!(dequeue_bytes(&queue)?.unwrap(), b"b");
    // Re-culling `[d, c, a]` would favor `c` now that `b` is gone.
    assert_eq!(dequeue_bytes(&queue)?.unwrap(), b"d");

    queue.enqueue(TestCase::executed(b"e".to_vec(), vec![9], 25))?;
    assert_eq!(dequeue_bytes(&queue)?.unwrap(), b"c");
    assert_eq!(dequeue_bytes(&queue)?.unwrap(), b"e");
    assert_eq!(dequeue_bytes(&queue)?.unwrap(), b"a");
    assert_eq!(dequeue_bytes(&queue)?, None);
    Ok(())
}

#[test]
fn snapshot_reflects_pending_order() -> anyhow::Result<()> {
    let queue = InMemoryQueue::new();
    queue.enqueue(TestCase::new(b"1".to_vec()))?;
    queue.enqueue(TestCase::new(b"2".to_vec()))?;
    let pending: Vec<_> = queue.snapshot().into_iter().map(TestCase::into_bytes).collect();
    assert_eq!(pending, [b"1".to_vec(), b"2".to_vec()]);
    Ok(())
}

#[test]
fn listener_sees_every_mutation() -> anyhow::Result<()> {
    init_logger();
    let calls = Arc::new(AtomicUsize::new(0));
    let queue = InMemoryQueue::new().on_mutated({
        let calls = calls.clone();
        move |_pending| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    queue.enqueue(TestCase::new(b"a".to_vec()))?;
    queue.enqueue(TestCase::new(b"b".to_vec()))?;
    queue.cull_and_dequeue()?;
    queue.cull_and_dequeue()?;
    // Dequeuing an empty queue changes nothing.
    queue.cull_and_dequeue()?;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    queue.close()?;
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    Ok(())
}

#[test]
fn failing_listener_fails_the_operation() -> anyhow::Result<()> {
    let queue = InMemoryQueue::new().on_mutated(|_| Err(covfuzz::Error::other("disk full")));
    let err = queue.enqueue(TestCase::new(b"a".to_vec())).unwrap_err();
    assert!(err.is_other());
    // The enqueue itself still happened.
    assert_eq!(queue.len(), 1);
    Ok(())
}

#[test]
fn failed_dequeue_keeps_the_seed() -> anyhow::Result<()> {
    init_logger();
    let failing = Arc::new(AtomicBool::new(false));
    let queue = InMemoryQueue::new().on_mutated({
        let failing = failing.clone();
        move |_| {
            if failing.load(Ordering::SeqCst) {
                Err(covfuzz::Error::other("disk full"))
            } else {
                Ok(())
            }
        }
    });
    queue.enqueue(TestCase::new(b"a".to_vec()))?;
    queue.enqueue(TestCase::executed(b"b".to_vec(), vec![1], 1))?;

    failing.store(true, Ordering::SeqCst);
    assert!(queue.cull_and_dequeue().unwrap_err().is_other());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.snapshot()[0].bytes(), b"b");

    failing.store(false, Ordering::SeqCst);
    let entry = queue.cull_and_dequeue()?.unwrap();
    assert_eq!(&entry.bytes()[..], b"b");
    // The failed attempt did not use up an index.
    assert_eq!(entry.dequeued_index(), 0);
    assert_eq!(dequeue_bytes(&queue)?, Some(b"a".to_vec()));
    Ok(())
}

#[test]
fn timed_dequeue_waits_for_an_enqueue() -> anyhow::Result<()> {
    init_logger();
    let queue = Arc::new(InMemoryQueue::new());
    assert!(queue.cull_and_dequeue_timeout(Duration::from_millis(10))?.is_none());

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            queue.enqueue(TestCase::new(b"late".to_vec()))
        })
    };
    let entry = queue.cull_and_dequeue_timeout(Duration::from_secs(30))?;
    producer.join().expect("producer panicked")?;
    assert_eq!(&entry.unwrap().bytes()[..], b"late");
    Ok(())
}
