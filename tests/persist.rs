#![cfg(feature = "persist")]

use covfuzz::{
    cache::CoverageCache,
    persist::{FileCache, FileQueue},
    queue::{InputQueue, TestCase},
    ByteArrayConfig, ByteArrayGenerator, ParamGen,
};
use std::{fs, io::Write, sync::Arc, time::Duration};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn queue_survives_reopening() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.bin");

    {
        let queue = FileQueue::open(&path)?;
        assert!(queue.is_empty());
        queue.enqueue(TestCase::new(b"fresh".to_vec()))?;
        queue.enqueue(TestCase::executed(b"ran".to_vec(), vec![7, 8], 40))?;
        queue.enqueue(TestCase::new(Vec::new()))?;
        queue.close()?;
    }
    assert_eq!(FileQueue::open(&path)?.path(), path);

    let queue = FileQueue::open(&path)?;
    assert_eq!(queue.len(), 3);
    let entry = queue.cull_and_dequeue()?.unwrap();
    assert_eq!(&entry.bytes()[..], b"ran");
    // Indices continue past the recovered cases.
    assert_eq!(entry.dequeued_index(), 3);
    drop(queue);

    let queue = FileQueue::open(&path)?;
    let pending: Vec<_> = std::iter::from_fn(|| queue.cull_and_dequeue().transpose())
        .map(|e| e.map(|e| e.bytes().to_vec()))
        .collect::<covfuzz::Result<_>>()?;
    assert_eq!(pending, [b"fresh".to_vec(), Vec::new()]);
    Ok(())
}

#[test]
fn corrupt_queue_snapshots_are_rejected() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.bin");

    // One case claiming five bytes, with only one present.
    fs::write(&path, [1, 0, 0, 0, 5, 0, 0, 0, b'a'])?;
    assert!(FileQueue::open(&path).unwrap_err().is_corrupt());

    // An empty queue followed by garbage.
    fs::write(&path, [0, 0, 0, 0, 9])?;
    assert!(FileQueue::open(&path).unwrap_err().is_corrupt());

    fs::write(&path, [0, 0])?;
    assert!(FileQueue::open(&path).unwrap_err().is_corrupt());
    Ok(())
}

fn snapshot_count(path: &std::path::Path) -> anyhow::Result<u32> {
    let data = fs::read(path)?;
    Ok(u32::from_le_bytes(data[..4].try_into()?))
}

#[test]
fn queue_snapshots_are_batched() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("queue.bin");

    let queue = FileQueue::open(&path)?.snapshot_interval(Duration::from_secs(3600));
    queue.enqueue(TestCase::new(b"a".to_vec()))?;
    queue.enqueue(TestCase::new(b"b".to_vec()))?;
    queue.enqueue(TestCase::new(b"c".to_vec()))?;
    // Only the first change was written.
    assert_eq!(snapshot_count(&path)?, 1);

    queue.cull_and_dequeue()?;
    queue.close()?;
    assert_eq!(snapshot_count(&path)?, 2);

    // Dropping writes any changes made since.
    queue.enqueue(TestCase::new(b"d".to_vec()))?;
    drop(queue);
    assert_eq!(snapshot_count(&path)?, 3);
    Ok(())
}

#[test]
fn failed_snapshot_keeps_the_dequeued_seed() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let sub = dir.path().join("corpus");
    fs::create_dir(&sub)?;
    let path = sub.join("queue.bin");

    let queue = FileQueue::open(&path)?.snapshot_interval(Duration::ZERO);
    queue.enqueue(TestCase::new(b"seed".to_vec()))?;
    fs::remove_dir_all(&sub)?;

    assert!(queue.cull_and_dequeue().unwrap_err().is_io());
    assert_eq!(queue.len(), 1);

    fs::create_dir(&sub)?;
    let entry = queue.cull_and_dequeue()?.unwrap();
    assert_eq!(&entry.bytes()[..], b"seed");
    assert_eq!(snapshot_count(&path)?, 0);
    Ok(())
}

#[test]
fn cache_survives_reopening() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.bin");

    {
        let cache = FileCache::open(&path)?;
        assert!(cache.check_unique_and_store(1)?);
        assert!(cache.check_unique_and_store(2)?);
        assert!(!cache.check_unique_and_store(2)?);
        cache.close()?;
    }
    assert_eq!(fs::metadata(&path)?.len(), 16);

    let cache = FileCache::open(&path)?;
    assert_eq!(cache.len(), 2);
    assert!(!cache.check_unique_and_store(1)?);
    assert!(cache.check_unique_and_store(3)?);
    Ok(())
}

#[test]
fn partial_cache_records_are_dropped() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("cache.bin");
    {
        let mut file = fs::File::create(&path)?;
        file.write_all(&10u64.to_le_bytes())?;
        file.write_all(&[0xff, 0xee, 0xdd])?;
    }

    {
        let cache = FileCache::open(&path)?;
        assert_eq!(cache.len(), 1);
        assert!(!cache.check_unique_and_store(10)?);
        assert!(cache.check_unique_and_store(11)?);
        cache.close()?;
    }
    assert_eq!(fs::metadata(&path)?.len(), 16);

    let cache = FileCache::open(&path)?;
    assert_eq!(cache.len(), 2);
    assert!(!cache.check_unique_and_store(11)?);
    Ok(())
}

#[test]
fn generator_resumes_from_files() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let queue_path = dir.path().join("queue.bin");
    let cache_path = dir.path().join("cache.bin");
    let config = || {
        let queue_path = queue_path.clone();
        let cache_path = cache_path.clone();
        ByteArrayConfig::default()
            .initial_values(vec![b"seed".to_vec()])
            .queue(move || -> covfuzz::Result<Box<dyn InputQueue>> {
                Ok(Box::new(FileQueue::open(&queue_path)?))
            })
            .cache(move || -> covfuzz::Result<Box<dyn CoverageCache>> {
                Ok(Box::new(FileCache::open(&cache_path)?))
            })
    };

    {
        let gen = ByteArrayGenerator::new(config())?;
        assert_eq!(gen.queue().len(), 1);
        assert!(gen.cache().check_unique_and_store(42)?);
        gen.close()?;
    }

    let gen = Arc::new(ByteArrayGenerator::new(config().initial_values(vec![]))?);
    // Recovered state: the seed is still queued and the fingerprint known.
    assert_eq!(gen.queue().len(), 1);
    assert!(!gen.cache().check_unique_and_store(42)?);
    let first = gen.clone().values().next().unwrap();
    assert_eq!(&first.entry().unwrap().bytes()[..], b"seed");
    gen.close()?;
    Ok(())
}
