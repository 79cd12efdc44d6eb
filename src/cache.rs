//! The set of coverage fingerprints seen so far.

use crate::Result;
use dashmap::DashSet;

/// A grow-only set of coverage fingerprints, used to decide whether an
/// execution took a path nobody has seen yet.
///
/// Implementations must be safe under any number of concurrent callers.
pub trait CoverageCache: Send + Sync {
    /// Atomically record `fingerprint`, returning `true` iff it was not
    /// already present.
    fn check_unique_and_store(&self, fingerprint: u64) -> Result<bool>;

    /// The number of fingerprints recorded.
    fn len(&self) -> usize;

    /// Whether no fingerprints have been recorded.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release any resources held by the cache.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// The default, in-memory [`CoverageCache`], backed by a concurrent hash set.
///
/// # Example
///
/// ```
/// # fn foo() -> covfuzz::Result<()> {
/// use covfuzz::cache::{CoverageCache, InMemoryCache};
///
/// let cache = InMemoryCache::new();
/// assert!(cache.check_unique_and_store(42)?);
/// assert!(!cache.check_unique_and_store(42)?);
/// # Ok(())
/// # }
/// # foo().unwrap();
/// ```
#[derive(Debug, Default)]
pub struct InMemoryCache {
    seen: DashSet<u64>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache already holding `fingerprints`.
    pub fn with_fingerprints(fingerprints: impl IntoIterator<Item = u64>) -> Self {
        Self {
            seen: fingerprints.into_iter().collect(),
        }
    }

    /// Record `fingerprint`, returning `true` iff it was new.
    #[inline]
    pub fn insert(&self, fingerprint: u64) -> bool {
        self.seen.insert(fingerprint)
    }
}

impl CoverageCache for InMemoryCache {
    fn check_unique_and_store(&self, fingerprint: u64) -> Result<bool> {
        Ok(self.insert(fingerprint))
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}
