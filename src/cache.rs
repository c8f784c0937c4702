//! Edge cache for full-object read responses.
//!
//! The read path talks to an [`EdgeCache`]: an injected key/value store
//! with per-entry TTL. [`MemoryEdgeCache`] is the in-process
//! implementation, bounded by entry count and total body bytes and
//! evicting least-recently-used entries first.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A response as stored in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    /// Header name/value pairs, in response order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Key/value cache of read responses.
pub trait EdgeCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Option<CachedResponse>> + Send + '_>>;

    fn put(
        &self,
        key: &str,
        response: CachedResponse,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

struct Entry {
    response: CachedResponse,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Entry>,
    /// Keys from least to most recently used.
    lru_order: VecDeque<String>,
    current_size: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            self.lru_order.remove(pos);
        }
        self.lru_order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_size = self
                .current_size
                .saturating_sub(entry.response.body.len() as u64);
        }
        if let Some(pos) = self.lru_order.iter().position(|k| k == key) {
            self.lru_order.remove(pos);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.lru_order.front().cloned() {
            Some(key) => {
                debug!("evicting cached response {}", key);
                self.remove(&key);
                true
            }
            None => false,
        }
    }
}

/// In-memory TTL cache.
pub struct MemoryEdgeCache {
    ttl: Duration,
    max_entries: usize,
    max_bytes: u64,
    state: Mutex<CacheState>,
}

impl MemoryEdgeCache {
    pub fn new(ttl: Duration, max_entries: usize, max_bytes: u64) -> Self {
        Self {
            ttl,
            max_entries,
            max_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        // A poisoned lock only means a panic mid-update of plain maps.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let mut state = self.lock();
        let expired = match state.entries.get(key) {
            None => return None,
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            state.remove(key);
            return None;
        }
        state.touch(key);
        state.entries.get(key).map(|e| e.response.clone())
    }

    fn store(&self, key: &str, response: CachedResponse) {
        let size = response.body.len() as u64;
        if size > self.max_bytes || self.max_entries == 0 {
            debug!("response for {} too large to cache ({} bytes)", key, size);
            return;
        }
        let mut state = self.lock();
        state.remove(key);
        while (state.entries.len() >= self.max_entries
            || state.current_size + size > self.max_bytes)
            && state.evict_oldest()
        {}
        state.entries.insert(
            key.to_string(),
            Entry {
                response,
                expires_at: Instant::now() + self.ttl,
            },
        );
        state.current_size += size;
        state.touch(key);
    }
}

impl EdgeCache for MemoryEdgeCache {
    fn get(&self, key: &str) -> Pin<Box<dyn Future<Output = Option<CachedResponse>> + Send + '_>> {
        let hit = self.lookup(key);
        Box::pin(async move { hit })
    }

    fn put(
        &self,
        key: &str,
        response: CachedResponse,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.store(key, response);
        Box::pin(async {})
    }
}
