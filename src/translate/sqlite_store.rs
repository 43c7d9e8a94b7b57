//! SQLite-backed translation store.
//! Survives process restarts. Stale rows (fingerprint no longer current) are
//! left in place and reaped by a background loop once past the retention age.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::store::{reap_cutoff, TranslationStore};
use crate::error::StoreError;
use crate::model::{now_unix, CacheEntry, PageFingerprint};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS translation_cache (
        source_lang TEXT NOT NULL,
        target_lang TEXT NOT NULL,
        text_hash TEXT NOT NULL,
        translated_text TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (source_lang, target_lang, text_hash)
    );
    CREATE INDEX IF NOT EXISTS idx_cache_updated
        ON translation_cache(updated_at);
    CREATE TABLE IF NOT EXISTS page_fingerprint (
        page_path TEXT PRIMARY KEY,
        hash TEXT NOT NULL,
        computed_at INTEGER NOT NULL
    );";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), "translation store opened");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl TranslationStore for SqliteStore {
    fn get(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        current_fingerprint: &str,
    ) -> Result<Option<CacheEntry>, StoreError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                "SELECT translated_text, fingerprint, updated_at FROM translation_cache
                 WHERE source_lang = ?1 AND target_lang = ?2 AND text_hash = ?3",
                params![source_lang, target_lang, text_hash],
                |row| {
                    Ok(CacheEntry {
                        source_lang: source_lang.to_string(),
                        target_lang: target_lang.to_string(),
                        text_hash: text_hash.to_string(),
                        translated_text: row.get(0)?,
                        page_fingerprint_hash: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;

        match entry {
            Some(e) if e.page_fingerprint_hash == current_fingerprint => Ok(Some(e)),
            Some(_) => {
                debug!(text_hash, "store entry stale for current fingerprint");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(
        &self,
        source_lang: &str,
        target_lang: &str,
        text_hash: &str,
        translated_text: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (source_lang, target_lang, text_hash, translated_text, fingerprint, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                source_lang,
                target_lang,
                text_hash,
                translated_text,
                fingerprint,
                now_unix()
            ],
        )?;
        Ok(())
    }

    fn current_fingerprint(&self, page_path: &str) -> Result<Option<PageFingerprint>, StoreError> {
        let conn = self.conn.lock();
        let fp = conn
            .query_row(
                "SELECT hash, computed_at FROM page_fingerprint WHERE page_path = ?1",
                params![page_path],
                |row| {
                    Ok(PageFingerprint {
                        page_path: page_path.to_string(),
                        hash: row.get(0)?,
                        computed_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(fp)
    }

    fn invalidate_page(&self, page_path: &str, next: &PageFingerprint) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO page_fingerprint (page_path, hash, computed_at)
             VALUES (?1, ?2, ?3)",
            params![page_path, next.hash, next.computed_at],
        )?;
        Ok(())
    }

    fn reap_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let cutoff = reap_cutoff(max_age);
        let removed = conn.execute(
            "DELETE FROM translation_cache
             WHERE updated_at <= ?1
               AND fingerprint NOT IN (SELECT hash FROM page_fingerprint)",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "translation store reaped stale entries");
        }
        Ok(removed)
    }
}
