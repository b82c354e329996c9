//! Bounded cache of transactions the engine is waiting to see on chain

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    /// Waiting for the transaction, since the given time
    Tracking(Instant),
    /// Already reported; later sightings are ignored
    Confirmed,
}

/// Hash -> tracking state. Least recently used entries fall out when the
/// cache is full; falling out means the hash is no longer tracked.
///
/// Confirmed hashes stay in the cache so that the same transaction seen in a
/// later block produces neither a second update nor a matched event.
pub struct TrackedTxCache {
    entries: Mutex<LruCache<String, Entry>>,
    case_insensitive: bool,
}

impl TrackedTxCache {
    pub fn new(capacity: usize, case_insensitive: bool) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            case_insensitive,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn key(&self, hash: &str) -> String {
        if self.case_insensitive {
            hash.to_ascii_lowercase()
        } else {
            hash.to_string()
        }
    }

    pub fn track(&self, hash: &str) {
        let key = self.key(hash);
        if let Some((evicted, _)) = self.lock().push(key.clone(), Entry::Tracking(Instant::now())) {
            if evicted != key {
                debug!(tx_hash = %evicted, "Tracked transaction evicted");
            }
        }
    }

    /// True while `hash` is awaited. Does not refresh recency.
    pub fn contains(&self, hash: &str) -> bool {
        matches!(self.lock().peek(&self.key(hash)), Some(Entry::Tracking(_)))
    }

    /// True once `hash` has been confirmed. Does not refresh recency.
    pub fn is_confirmed(&self, hash: &str) -> bool {
        matches!(self.lock().peek(&self.key(hash)), Some(Entry::Confirmed))
    }

    /// Mark `hash` as confirmed; true only on the first call for a tracked hash
    pub fn confirm(&self, hash: &str) -> bool {
        let key = self.key(hash);
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(entry) if matches!(entry, Entry::Tracking(_)) => {
                *entry = Entry::Confirmed;
                true
            }
            _ => false,
        }
    }

    /// Remove and return every hash awaited for longer than `max_age`
    pub fn expire(&self, max_age: Duration) -> Vec<String> {
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Tracking(since) if since.elapsed() >= max_age))
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in &expired {
            entries.pop(hash);
        }
        expired
    }

    /// Number of hashes still awaited
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Tracking(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirm_once() {
        let cache = TrackedTxCache::new(4, true);
        cache.track("0xABC");
        assert!(cache.contains("0xabc"));
        assert!(cache.confirm("0xAbC"));
        assert!(!cache.confirm("0xabc"));
        assert!(!cache.contains("0xabc"));
        assert!(cache.is_confirmed("0xABC"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_untracked_hash_is_never_confirmed() {
        let cache = TrackedTxCache::new(4, true);
        assert!(!cache.confirm("0xnope"));
        assert!(!cache.is_confirmed("0xnope"));
    }

    #[test]
    fn test_case_sensitive_keys() {
        let cache = TrackedTxCache::new(4, false);
        cache.track("Abc");
        assert!(!cache.contains("abc"));
        assert!(cache.contains("Abc"));
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = TrackedTxCache::new(2, true);
        cache.track("0x1");
        cache.track("0x2");
        // re-tracking refreshes recency
        cache.track("0x1");
        cache.track("0x3");

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("0x1"));
        assert!(!cache.contains("0x2"));
        assert!(cache.contains("0x3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_returns_only_old_entries() {
        let cache = TrackedTxCache::new(8, true);
        cache.track("0xold");
        cache.track("0xdone");
        cache.confirm("0xdone");
        tokio::time::advance(Duration::from_secs(120)).await;
        cache.track("0xnew");

        let expired = cache.expire(Duration::from_secs(60));
        assert_eq!(expired, vec!["0xold".to_string()]);
        assert!(!cache.contains("0xold"));
        assert!(cache.contains("0xnew"));
        assert!(cache.is_confirmed("0xdone"));
    }
}
