//! # Response cache
//!
//! A bounded key-value store for query results. Entries carry an absolute expiry; expired
//! entries are dropped lazily when read and never returned. When full, the least recently
//! accessed entry makes room for a new one.
use std::{num::NonZeroUsize, time::Duration};

use lru::LruCache;
use metrics::{counter, gauge};
use regex::Regex;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use tether_common::{
    dto::OperationKind,
    keys::operation_key,
};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CacheError {
    #[error("Cache size cannot be 0")]
    InvalidCacheSize,
    #[error("Invalid invalidation pattern: {0}")]
    InvalidPattern(String),
}

/// Selects the entries removed by [`ResponseCache::invalidate`].
#[derive(Debug, Clone)]
pub enum CacheMatcher {
    Exact(String),
    Pattern(Regex),
}

impl CacheMatcher {
    pub fn exact(key: impl Into<String>) -> Self {
        CacheMatcher::Exact(key.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self, CacheError> {
        Regex::new(pattern)
            .map(CacheMatcher::Pattern)
            .map_err(|e| CacheError::InvalidPattern(e.to_string()))
    }

    /// Matches the entry cached for exactly this query.
    pub fn query(operation: &str, variables: &Value) -> Self {
        CacheMatcher::Exact(operation_key(OperationKind::Query, operation, variables))
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            CacheMatcher::Exact(exact) => exact == key,
            CacheMatcher::Pattern(re) => re.is_match(key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

pub struct ResponseCache {
    entries: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Result<Self, CacheError> {
        let capacity = NonZeroUsize::new(max_entries).ok_or(CacheError::InvalidCacheSize)?;
        Ok(Self { entries: LruCache::new(capacity), hits: 0, misses: 0, evictions: 0 })
    }

    /// Returns the value stored under `key` if it has not expired yet.
    ///
    /// A hit promotes the entry to most recently used. An expired entry is removed and
    /// counted as a miss.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if now < entry.expires_at => {
                self.hits += 1;
                counter!("tether_cache_hits").increment(1);
                trace!("CacheHit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.pop(key);
            trace!("CacheExpired");
        }
        self.misses += 1;
        counter!("tether_cache_misses").increment(1);
        trace!("CacheMiss");
        None
    }

    pub fn set(&mut self, key: String, value: Value, ttl: Duration) {
        let entry = CacheEntry { value, expires_at: Instant::now() + ttl };
        if let Some((evicted, _)) = self.entries.push(key.clone(), entry) {
            // `push` also hands back the previous value when the key was already present
            if evicted != key {
                self.evictions += 1;
                counter!("tether_cache_evictions").increment(1);
                trace!("CacheEviction");
            }
        }
        gauge!("tether_cache_entry_count").set(self.entries.len() as f64);
    }

    /// Removes every entry selected by `matcher`, returning how many were removed.
    pub fn invalidate(&mut self, matcher: &CacheMatcher) -> usize {
        let keys: Vec<String> = match matcher {
            CacheMatcher::Exact(key) => {
                if self.entries.contains(key) {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            CacheMatcher::Pattern(_) => self
                .entries
                .iter()
                .filter(|(k, _)| matcher.matches(k))
                .map(|(k, _)| k.clone())
                .collect(),
        };
        for key in keys.iter() {
            self.entries.pop(key);
        }
        gauge!("tether_cache_entry_count").set(self.entries.len() as f64);
        keys.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        gauge!("tether_cache_entry_count").set(0.0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}
