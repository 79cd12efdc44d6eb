//! File-backed input queues and coverage caches that survive restarts.
//!
//! Both recover their previous state when opened, so a fuzzing run can pick
//! up where the last one stopped:
//!
//! ```no_run
//! # fn foo() -> covfuzz::Result<()> {
//! use covfuzz::{
//!     persist::{FileCache, FileQueue},
//!     ByteArrayConfig,
//! };
//!
//! let config = ByteArrayConfig::default()
//!     .queue(|| Ok(Box::new(FileQueue::open("corpus/queue.bin")?)))
//!     .cache(|| Ok(Box::new(FileCache::open("corpus/cache.bin")?)));
//! # Ok(())
//! # }
//! ```

use crate::{
    cache::{CoverageCache, InMemoryCache},
    lock,
    queue::{InMemoryQueue, InputQueue, QueueEntry, TestCase},
    Error, Result,
};
use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Marks a test case that never ran, in place of a branch-hash count.
const NO_HASHES: u32 = u32::MAX;

/// Marks a test case that was never timed, in place of its duration.
const NO_NANOS: i64 = -1;

/// The default minimum time between two queue snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// An [`InputQueue`] whose pending test cases are snapshotted to a file.
///
/// The snapshot is rewritten, through a temporary file and a rename, after an
/// enqueue or dequeue when at least the [snapshot
/// interval][FileQueue::snapshot_interval] has passed since the last write,
/// and whenever the queue is closed or dropped with unwritten changes. A
/// crash loses at most one interval's worth of queue changes.
///
/// The snapshot is a little-endian `u32` case
/// count followed by, for each case: a `u32` length and that many bytes, a
/// `u32` branch-hash count (`u32::MAX` if the case never ran) and that many
/// `u64` hashes, and an `i64` duration in nanoseconds (`-1` if untimed).
pub struct FileQueue {
    path: PathBuf,
    inner: InMemoryQueue,
    snapshots: Arc<Mutex<Snapshots>>,
}

/// Throttles snapshot writes. Never locked before the queue's own lock.
#[derive(Debug)]
struct Snapshots {
    path: PathBuf,
    interval: Duration,
    last_write: Option<Instant>,
    dirty: bool,
}

impl Snapshots {
    fn on_mutated(&mut self, pending: &VecDeque<TestCase>) -> Result<()> {
        if self.last_write.map_or(true, |t| t.elapsed() >= self.interval) {
            self.write(pending)
        } else {
            self.dirty = true;
            Ok(())
        }
    }

    fn write(&mut self, pending: &VecDeque<TestCase>) -> Result<()> {
        self.dirty = true;
        write_snapshot(&self.path, pending)?;
        self.last_write = Some(Instant::now());
        self.dirty = false;
        Ok(())
    }
}

impl fmt::Debug for FileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQueue")
            .field("path", &self.path)
            .field("inner", &self.inner)
            .finish()
    }
}

impl FileQueue {
    /// Open the queue at `path`, recovering its test cases if the file
    /// exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cases = match fs::read(&path) {
            Ok(data) => decode_queue(&data)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        log::info!("recovered {} queued test cases from {}", cases.len(), path.display());

        let snapshots = Arc::new(Mutex::new(Snapshots {
            path: path.clone(),
            interval: DEFAULT_SNAPSHOT_INTERVAL,
            last_write: None,
            dirty: false,
        }));
        let inner = InMemoryQueue::with_cases(cases).on_mutated({
            let snapshots = snapshots.clone();
            move |pending| lock(&snapshots).on_mutated(pending)
        });
        Ok(Self {
            path,
            inner,
            snapshots,
        })
    }

    /// Set the minimum time between two snapshot writes. `Duration::ZERO`
    /// writes after every enqueue and dequeue.
    pub fn snapshot_interval(self, interval: Duration) -> Self {
        lock(&self.snapshots).interval = interval;
        self
    }

    /// Write the snapshot now.
    fn flush(&self) -> Result<()> {
        self.inner
            .with_pending(|pending| lock(&self.snapshots).write(pending))
    }

    /// The snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// See [`InMemoryQueue::cull_and_dequeue_timeout`].
    pub fn cull_and_dequeue_timeout(&self, timeout: Duration) -> Result<Option<QueueEntry>> {
        self.inner.cull_and_dequeue_timeout(timeout)
    }
}

impl InputQueue for FileQueue {
    fn enqueue(&self, case: TestCase) -> Result<()> {
        self.inner.enqueue(case)
    }

    fn cull_and_dequeue(&self) -> Result<Option<QueueEntry>> {
        self.inner.cull_and_dequeue()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

impl Drop for FileQueue {
    fn drop(&mut self) {
        if !lock(&self.snapshots).dirty {
            return;
        }
        if let Err(e) = self.flush() {
            log::error!("failed to write queue snapshot {}: {e}", self.path.display());
        }
    }
}

fn write_snapshot(path: &Path, pending: &VecDeque<TestCase>) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut out = BufWriter::new(File::create(&tmp)?);
    write_u32(&mut out, pending.len())?;
    for case in pending {
        write_u32(&mut out, case.bytes().len())?;
        out.write_all(case.bytes())?;
        match case.branch_hashes() {
            Some(hashes) => {
                write_u32(&mut out, hashes.len())?;
                for h in hashes {
                    out.write_all(&h.to_le_bytes())?;
                }
            }
            None => out.write_all(&NO_HASHES.to_le_bytes())?,
        }
        let nanos = case
            .nanos()
            .map_or(NO_NANOS, |n| i64::try_from(n).unwrap_or(i64::MAX));
        out.write_all(&nanos.to_le_bytes())?;
    }
    out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    fs::rename(&tmp, path)?;
    log::trace!("wrote {} queued test cases to {}", pending.len(), path.display());
    Ok(())
}

fn write_u32(out: &mut impl Write, n: usize) -> Result<()> {
    let n = u32::try_from(n)
        .ok()
        .filter(|n| *n != NO_HASHES)
        .ok_or_else(|| Error::other("queue snapshot field too large"))?;
    out.write_all(&n.to_le_bytes())?;
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < n {
            return Err(Error::corrupt("queue snapshot is truncated"));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn len(&mut self) -> Result<usize> {
        let n = self.u32()? as usize;
        // Every length counts at least one byte that must still be present.
        if n > self.data.len() {
            return Err(Error::corrupt("queue snapshot length exceeds file size"));
        }
        Ok(n)
    }
}

fn decode_queue(data: &[u8]) -> Result<Vec<TestCase>> {
    let mut r = Reader { data };
    let count = r.len()?;
    let mut cases = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r.len()?;
        let bytes = r.take(len)?.to_vec();
        let hashes = match r.u32()? {
            NO_HASHES => None,
            n => {
                let mut hashes = Vec::with_capacity((n as usize).min(r.data.len() / 8));
                for _ in 0..n {
                    hashes.push(u64::from_le_bytes(r.array()?));
                }
                Some(hashes)
            }
        };
        let nanos = match i64::from_le_bytes(r.array()?) {
            NO_NANOS => None,
            n => Some(u64::try_from(n).map_err(|_| Error::corrupt("negative duration"))?),
        };
        cases.push(TestCase::from_parts(bytes, hashes, nanos));
    }
    if !r.data.is_empty() {
        return Err(Error::corrupt("trailing data after queue snapshot"));
    }
    Ok(cases)
}

/// A [`CoverageCache`] that appends every new fingerprint to a log file.
///
/// The log is a sequence of little-endian `u64`s, replayed into memory when
/// the cache is opened. A partial record at the end, left by a crash
/// mid-write, is ignored.
pub struct FileCache {
    path: PathBuf,
    seen: InMemoryCache,
    log: Mutex<BufWriter<File>>,
}

impl fmt::Debug for FileCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCache")
            .field("path", &self.path)
            .field("len", &self.seen.len())
            .finish_non_exhaustive()
    }
}

impl FileCache {
    /// Open the cache at `path`, replaying its log if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let records = data.chunks_exact(8);
        if !records.remainder().is_empty() {
            log::warn!(
                "ignoring {} trailing bytes of partial record in {}",
                records.remainder().len(),
                path.display()
            );
            // Appends must start on a record boundary.
            file.set_len((data.len() - records.remainder().len()) as u64)?;
        }
        let seen = InMemoryCache::with_fingerprints(records.map(|chunk| {
            let mut buf = [0; 8];
            buf.copy_from_slice(chunk);
            u64::from_le_bytes(buf)
        }));
        log::info!("recovered {} fingerprints from {}", seen.len(), path.display());

        Ok(Self {
            path,
            seen,
            log: Mutex::new(BufWriter::new(file)),
        })
    }

    /// The log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CoverageCache for FileCache {
    fn check_unique_and_store(&self, fingerprint: u64) -> Result<bool> {
        if !self.seen.insert(fingerprint) {
            return Ok(false);
        }
        let mut log = lock(&self.log);
        log.write_all(&fingerprint.to_le_bytes())?;
        log.flush()?;
        Ok(true)
    }

    fn len(&self) -> usize {
        self.seen.len()
    }

    fn close(&self) -> Result<()> {
        let mut log = lock(&self.log);
        log.flush()?;
        log.get_ref().sync_all()?;
        Ok(())
    }
}
