//! Response and negative caches keyed by record id.

use crate::record::{RecordError, Response};
use log::debug;
use lru::LruCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;

/// 负缓存的哨兵值
const SENTINEL: [u8; 1] = [0];

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Entry of {size} bytes exceeds the {max} byte entry limit")]
    EntryTooLarge { size: usize, max: usize },

    #[error("Cached value is corrupt: {0}")]
    Corrupt(#[from] RecordError),
}

/// Internally synchronized byte cache. Callers never lock.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    fn remove(&self, key: &str);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<String, Entry>,
    bytes: usize,
}

impl Inner {
    fn pop(&mut self, key: &str) -> Option<Entry> {
        let entry = self.entries.pop(key)?;
        self.bytes -= key.len() + entry.value.len();
        Some(entry)
    }
}

/// TTL cache with an aggregate byte ceiling. Reads do not refresh recency, so
/// when the ceiling is hit the least recently written entries go first.
pub struct TtlCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    max_bytes: usize,
    max_entry_bytes: usize,
}

impl TtlCache {
    pub fn new(ttl: Duration, max_bytes: usize, max_entry_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            ttl,
            max_bytes,
            max_entry_bytes: max_entry_bytes.min(max_bytes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前占用的字节数（键加值）
    pub fn size_bytes(&self) -> usize {
        self.lock().bytes
    }

    /// 清理过期条目
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }

    /// Background task purging expired entries every `interval`. Ends on its
    /// own once the cache is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cache = match cache.upgrade() {
                    Some(cache) => cache,
                    None => break,
                };
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired cache entries", purged);
                }
            }
        })
    }
}

impl Cache for TtlCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.lock();
        let expired = match inner.entries.peek(key) {
            Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.pop(key);
        }
        None
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let size = key.len() + value.len();
        if size > self.max_entry_bytes {
            return Err(CacheError::EntryTooLarge { size, max: self.max_entry_bytes });
        }

        let mut inner = self.lock();
        inner.pop(key);
        inner.entries.put(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((k, e)) => inner.bytes -= k.len() + e.value.len(),
                None => break,
            }
        }
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.lock().pop(key);
    }

    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// 成功查询结果的缓存，值为记录的线格式
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<dyn Cache>,
}

impl ResponseCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    /// A corrupt entry is dropped and reported as an error.
    pub fn get(&self, id: &str) -> Result<Option<Response>, CacheError> {
        let bytes = match self.inner.get(id) {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        match Response::from_bytes(&bytes) {
            Ok(response) => Ok(Some(response)),
            Err(e) => {
                self.inner.remove(id);
                Err(e.into())
            }
        }
    }

    pub fn set(&self, id: &str, response: &Response) -> Result<(), CacheError> {
        self.inner.set(id, response.to_bytes())
    }
}

/// Ids that recently missed everywhere. Presence is the signal.
#[derive(Clone)]
pub struct NegativeCache {
    inner: Arc<dyn Cache>,
}

impl NegativeCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.get(id).is_some()
    }

    pub fn mark(&self, id: &str) -> Result<(), CacheError> {
        self.inner.set(id, SENTINEL.to_vec())
    }

    pub fn clear(&self, id: &str) {
        self.inner.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(20), 1024, 1024);
        cache.set("a", vec![1, 2, 3]).unwrap();
        assert_eq!(cache.get("a"), Some(vec![1, 2, 3]));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_size_ceiling_evicts_oldest_write() {
        // 每个条目 1 + 9 = 10 字节
        let cache = TtlCache::new(Duration::from_secs(60), 30, 30);
        cache.set("a", vec![0; 9]).unwrap();
        cache.set("b", vec![0; 9]).unwrap();
        cache.set("c", vec![0; 9]).unwrap();

        // 读取不改变淘汰顺序
        assert!(cache.get("a").is_some());
        cache.set("d", vec![0; 9]).unwrap();

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.size_bytes(), 30);
    }

    #[test]
    fn test_rejects_oversized_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 100, 10);
        assert!(matches!(cache.set("key", vec![0; 20]), Err(CacheError::EntryTooLarge { .. })));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_updates_size() {
        let cache = TtlCache::new(Duration::from_secs(60), 100, 100);
        cache.set("k", vec![0; 10]).unwrap();
        cache.set("k", vec![0; 4]).unwrap();
        assert_eq!(cache.size_bytes(), 5);
        cache.remove("k");
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let cache = TtlCache::new(Duration::from_millis(10), 100, 100);
        cache.set("x", vec![1]).unwrap();
        cache.set("y", vec![1]).unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_negative_cache_marks() {
        let negative = NegativeCache::new(Arc::new(TtlCache::new(Duration::from_secs(30), 1024, 64)));
        assert!(!negative.contains("id"));
        negative.mark("id").unwrap();
        assert!(negative.contains("id"));
        negative.clear("id");
        assert!(!negative.contains("id"));
    }

    #[test]
    fn test_response_cache_drops_corrupt_entries() {
        let inner: Arc<dyn Cache> = Arc::new(TtlCache::new(Duration::from_secs(30), 4096, 2048));
        let responses = ResponseCache::new(inner.clone());

        let response = Response { value: b"v".to_vec(), sequence: 4, signature: [7u8; 64] };
        responses.set("id", &response).unwrap();
        assert_eq!(responses.get("id").unwrap(), Some(response));

        inner.set("bad", vec![1, 2, 3]).unwrap();
        assert!(responses.get("bad").is_err());
        assert!(inner.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_janitor_purges() {
        let cache = Arc::new(TtlCache::new(Duration::from_millis(10), 100, 100));
        cache.set("x", vec![1]).unwrap();
        let janitor = cache.spawn_janitor(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cache.len(), 0);
        janitor.abort();
    }
}
