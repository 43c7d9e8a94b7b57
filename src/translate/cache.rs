//! Ephemeral in-process translation cache (LRU with TTL).
//! Keyed by language pair and exact source-text hash, so it survives page
//! fingerprint changes: the translation of identical text does not depend on
//! the page it sits on. Each entry remembers the fingerprint it was last
//! persisted under, which lets the orchestrator carry it forward into the
//! durable store after a page edit.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EphemeralKey {
    source_lang: String,
    target_lang: String,
    text_hash: String,
}

struct EphemeralEntry {
    translated_text: String,
    fingerprint: String,
    inserted_at: Instant,
}

/// A cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralHit {
    pub translated_text: String,
    /// Fingerprint the translation was last written to the durable store under.
    pub fingerprint: String,
}

pub struct EphemeralCache {
    inner: Mutex<LruCache<EphemeralKey, EphemeralEntry>>,
    ttl: Duration,
}

impl EphemeralCache {
    /// `capacity` of zero is raised to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn key(source_lang: &str, target_lang: &str, text_hash: &str) -> EphemeralKey {
        EphemeralKey {
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            text_hash: text_hash.to_string(),
        }
    }

    /// Look up a cached translation. Returns None if absent or expired.
    pub fn get(&self, source_lang: &str, target_lang: &str, text_hash: &str) -> Option<EphemeralHit> {
        let key = Self::key(source_lang, target_lang, text_hash);
        let mut cache = self.inner.lock();
        if let Some(entry) = cache.get(&key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(EphemeralHit {
                    translated_text: entry.translated_text.clone(),
                    fingerprint: entry.fingerprint.clone(),
                });
            }
            // Expired, drop it
            cache.pop(&key);
        }
        None
    }

    pub fn insert(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        translated_text: String,
        fingerprint: &str,
    ) {
        let mut cache = self.inner.lock();
        cache.put(
            Self::key(source_lang, target_lang, text_hash),
            EphemeralEntry {
                translated_text,
                fingerprint: fingerprint.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Re-tag an entry after it was carried forward to a new fingerprint.
    /// Keeps the original insertion time so the TTL still bounds its life.
    pub fn retag(&self, source_lang: &str, target_lang: &str, text_hash: &str, fingerprint: &str) {
        let key = Self::key(source_lang, target_lang, text_hash);
        if let Some(entry) = self.inner.lock().peek_mut(&key) {
            entry.fingerprint = fingerprint.to_string();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
