//! Durable translation cache contract.
//! Entries are keyed by `(source_lang, target_lang, text_hash)` and tagged with
//! the page fingerprint they were written under; a lookup only hits when that
//! tag equals the caller's current fingerprint. One current fingerprint
//! record is kept per page path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{now_unix, CacheEntry, PageFingerprint};

/// Persistent translation store. Every method is atomic per key; callers
/// never mutate entries directly.
pub trait TranslationStore: Send + Sync {
    /// Hit only when the stored entry was written under `current_fingerprint`.
    fn get(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        current_fingerprint: &str,
    ) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or overwrite; last writer wins.
    fn put(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        translated_text: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError>;

    fn current_fingerprint(&self, page_path: &str) -> Result<Option<PageFingerprint>, StoreError>;

    /// Advance the page's current fingerprint pointer to `next`. Entries
    /// written under the old fingerprint become unreachable but are not
    /// deleted here.
    fn invalidate_page(&self, page_path: &str, next: &PageFingerprint) -> Result<(), StoreError>;

    /// Delete entries older than `max_age` whose fingerprint is no longer
    /// current for any page. Returns the number removed.
    fn reap_stale(&self, max_age: Duration) -> Result<usize, StoreError>;
}

/// Start a background loop that reaps stale entries every `interval` until
/// `shutdown` is cancelled.
pub fn spawn_reaper(
    store: Arc<dyn TranslationStore>,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => {
                    debug!("store reaper exiting");
                    return;
                }
            }
            if let Err(e) = store.reap_stale(max_age) {
                warn!(error = %e, "store reap failed");
            }
        }
    })
}

/// Unix time before which an entry counts as older than `max_age`.
pub(crate) fn reap_cutoff(max_age: Duration) -> i64 {
    let age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
    now_unix().saturating_sub(age)
}

type EntryKey = (String, String, String);

/// In-process store. Survives nothing beyond the process; used when no
/// store path is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<EntryKey, CacheEntry>>,
    pages: RwLock<HashMap<String, PageFingerprint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical entries, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    fn backdate_all(&self, secs: i64) {
        for e in self.entries.write().values_mut() {
            e.updated_at -= secs;
        }
    }
}

impl TranslationStore for MemoryStore {
    fn get(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        current_fingerprint: &str,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let key = (
            source_lang.to_string(),
            target_lang.to_string(),
            text_hash.to_string(),
        );
        Ok(self
            .entries
            .read()
            .get(&key)
            .filter(|e| e.page_fingerprint_hash == current_fingerprint)
            .cloned())
    }

    fn put(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        translated_text: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry {
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            text_hash: text_hash.to_string(),
            translated_text: translated_text.to_string(),
            page_fingerprint_hash: fingerprint.to_string(),
            updated_at: now_unix(),
        };
        let key = (
            entry.source_lang.clone(),
            entry.target_lang.clone(),
            entry.text_hash.clone(),
        );
        self.entries.write().insert(key, entry);
        Ok(())
    }

    fn current_fingerprint(&self, page_path: &str) -> Result<Option<PageFingerprint>, StoreError> {
        Ok(self.pages.read().get(page_path).cloned())
    }

    fn invalidate_page(&self, page_path: &str, next: &PageFingerprint) -> Result<(), StoreError> {
        self.pages.write().insert(page_path.to_string(), next.clone());
        Ok(())
    }

    fn reap_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        let live: HashSet<String> = self.pages.read().values().map(|p| p.hash.clone()).collect();
        let cutoff = reap_cutoff(max_age);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| live.contains(&e.page_fingerprint_hash) || e.updated_at > cutoff);
        Ok(before - entries.len())
    }
}
