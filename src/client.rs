//! Translation client facade: the one entry point rendering code calls.
//! Native-language targets short-circuit to the source text. Everything else
//! goes through a page pass, shared between concurrent callers for the same
//! `(page_path, target_lang)` and discarded if the page moved on meanwhile.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancellation::PageGenerations;
use crate::circuit::CircuitTracker;
use crate::config::EngineConfig;
use crate::content::ContentProvider;
use crate::error::BuildError;
use crate::fingerprint::{Blake3Hasher, FingerprintEngine, FragmentHasher};
use crate::inflight::{Acquired, InFlight};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::model::{LanguageSet, TextFragment};
use crate::orchestrator::{identity_mapping, BatchOrchestrator, PassOutcome, PassStats};
use crate::translate::cache::EphemeralCache;
use crate::translate::http::HttpProvider;
use crate::translate::sqlite_store::SqliteStore;
use crate::translate::store::{spawn_reaper, MemoryStore, TranslationStore};
use crate::translate::TranslationProvider;

/// Displayed text for every fragment of a page.
#[derive(Debug, Clone, Serialize)]
pub struct PageTranslation {
    pub page_path: String,
    pub target_lang: String,
    /// Fragment id → text to display.
    pub translations: HashMap<String, String>,
    pub fingerprint: String,
    /// The page changed or was navigated away from while the pass ran.
    /// `translations` is then the identity mapping.
    pub stale: bool,
    pub stats: PassStats,
}

type PassKey = (String, String);

struct MemoEntry {
    last_modified: i64,
    outcome: Arc<PassOutcome>,
}

pub struct TranslationClient {
    languages: LanguageSet,
    orchestrator: Arc<BatchOrchestrator>,
    content: Option<Arc<dyn ContentProvider>>,
    inflight: Arc<InFlight<PassKey, Arc<PassOutcome>>>,
    navigation: PageGenerations,
    memo: Mutex<HashMap<PassKey, MemoEntry>>,
    metrics: Arc<MetricsRegistry>,
    reaper: Option<(CancellationToken, JoinHandle<()>)>,
}

pub struct ClientBuilder {
    provider: Arc<dyn TranslationProvider>,
    config: EngineConfig,
    store: Option<Arc<dyn TranslationStore>>,
    content: Option<Arc<dyn ContentProvider>>,
    hasher: Option<Arc<dyn FragmentHasher>>,
    reaper: bool,
}

impl ClientBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use this store instead of the one `config.store_path` selects.
    pub fn store(mut self, store: Arc<dyn TranslationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn content(mut self, content: Arc<dyn ContentProvider>) -> Self {
        self.content = Some(content);
        self
    }

    pub fn hasher(mut self, hasher: Arc<dyn FragmentHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Run the retention reaper in the background (needs a tokio runtime).
    pub fn reaper(mut self, enabled: bool) -> Self {
        self.reaper = enabled;
        self
    }

    pub fn build(self) -> Result<TranslationClient, BuildError> {
        let languages = self.config.validate()?;

        let store: Arc<dyn TranslationStore> = match (self.store, &self.config.store_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(SqliteStore::open(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };

        let metrics = Arc::new(MetricsRegistry::new());
        let hasher = self.hasher.unwrap_or_else(|| Arc::new(Blake3Hasher));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            self.provider,
            Arc::clone(&store),
            Arc::new(EphemeralCache::new(
                self.config.ephemeral_capacity,
                self.config.ephemeral_ttl(),
            )),
            Arc::new(CircuitTracker::new(self.config.max_retries)),
            FingerprintEngine::new(hasher),
            Arc::clone(&metrics),
            &self.config,
        ));

        let reaper = if self.reaper {
            if tokio::runtime::Handle::try_current().is_ok() {
                let shutdown = CancellationToken::new();
                let handle = spawn_reaper(
                    Arc::clone(&store),
                    self.config.reap_interval(),
                    self.config.retention(),
                    shutdown.clone(),
                );
                Some((shutdown, handle))
            } else {
                warn!("no tokio runtime, store reaper not started");
                None
            }
        } else {
            None
        };

        info!(
            native = %languages.native().code,
            batch_size = self.config.batch_size,
            durable = self.config.store_path.is_some(),
            "translation client ready"
        );

        Ok(TranslationClient {
            languages,
            orchestrator,
            content: self.content,
            inflight: Arc::new(InFlight::new()),
            navigation: PageGenerations::new(),
            memo: Mutex::new(HashMap::new()),
            metrics,
            reaper,
        })
    }
}

impl TranslationClient {
    pub fn builder(provider: Arc<dyn TranslationProvider>) -> ClientBuilder {
        ClientBuilder {
            provider,
            config: EngineConfig::default(),
            store: None,
            content: None,
            hasher: None,
            reaper: false,
        }
    }

    /// Client backed by the HTTP provider described in `config.provider`,
    /// with the retention reaper running.
    pub fn from_config(
        config: EngineConfig,
        content: Option<Arc<dyn ContentProvider>>,
    ) -> Result<Self, BuildError> {
        let provider = Arc::new(HttpProvider::new(&config.provider)?);
        let mut builder = Self::builder(provider).config(config).reaper(true);
        if let Some(content) = content {
            builder = builder.content(content);
        }
        builder.build()
    }

    pub fn languages(&self) -> &LanguageSet {
        &self.languages
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn circuit(&self) -> &Arc<CircuitTracker> {
        self.orchestrator.circuit()
    }

    fn is_identity(&self, source_lang: &str, target_lang: &str) -> bool {
        source_lang == target_lang || self.languages.is_native(target_lang)
    }

    /// The user moved to `page_path`. Passes for any other page finish their
    /// current batch, skip the rest, and report their results as stale.
    /// Passes for `page_path` itself keep running.
    pub fn navigate(&self, page_path: &str) {
        let left = self.navigation.navigate_to(page_path);
        debug!(page = page_path, pages_cancelled = left, "navigation");
    }

    /// Translate a whole page. Never fails; anything unresolved keeps its
    /// source text.
    pub async fn translate_page(
        &self,
        page_path: &str,
        fragments: &[TextFragment],
        source_lang: &str,
        target_lang: &str,
    ) -> PageTranslation {
        if self.is_identity(source_lang, target_lang) {
            return PageTranslation {
                page_path: page_path.to_string(),
                target_lang: target_lang.to_string(),
                translations: identity_mapping(fragments),
                fingerprint: self.orchestrator.fingerprints().fingerprint(fragments),
                stale: false,
                stats: PassStats {
                    fragments: fragments.len(),
                    ..PassStats::default()
                },
            };
        }

        let (outcome, stale) = self
            .run_page(page_path, fragments, source_lang, target_lang)
            .await;
        let translations = if stale {
            identity_mapping(fragments)
        } else {
            outcome.mapping_for(fragments)
        };
        PageTranslation {
            page_path: page_path.to_string(),
            target_lang: target_lang.to_string(),
            translations,
            fingerprint: outcome.fingerprint.clone(),
            stale,
            stats: outcome.stats.clone(),
        }
    }

    /// Run or join the page pass for `(page_path, target_lang)`. Returns the
    /// outcome and whether it is stale for this caller.
    async fn run_page(
        &self,
        page_path: &str,
        fragments: &[TextFragment],
        source_lang: &str,
        target_lang: &str,
    ) -> (Arc<PassOutcome>, bool) {
        let guard = self.navigation.guard(page_path);
        let fingerprint = self.orchestrator.fingerprints().fingerprint(fragments);
        let key = (page_path.to_string(), target_lang.to_string());

        let outcome = loop {
            match self.inflight.acquire(key.clone()) {
                Acquired::Leader(leader) => {
                    let outcome = Arc::new(
                        self.orchestrator
                            .translate_page(page_path, fragments, source_lang, target_lang, guard.token())
                            .await,
                    );
                    leader.complete(Arc::clone(&outcome));
                    break outcome;
                }
                Acquired::Follower(follower) => {
                    self.metrics.incr(metric_names::PASSES_JOINED);
                    debug!(page = page_path, target_lang, "joining in-flight pass");
                    match follower.wait().await {
                        Some(o) if o.complete && o.fingerprint == fingerprint => break o,
                        // Different content or a cut-short pass: run our own
                        _ => continue,
                    }
                }
            }
        };

        let current = self.orchestrator.current_fingerprint(page_path).await;
        let stale = !guard.is_current() || current.as_deref() != Some(outcome.fingerprint.as_str());
        if stale {
            self.metrics.incr(metric_names::PASSES_STALE);
            info!(
                page = page_path,
                target_lang,
                fingerprint = %outcome.fingerprint,
                current = current.as_deref().unwrap_or("none"),
                "discarding stale pass result"
            );
        }
        (outcome, stale)
    }

    /// Translate one text shown on `page_path`. Rendering code calls this;
    /// it always returns something displayable.
    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        page_path: &str,
    ) -> String {
        if self.is_identity(source_lang, target_lang) {
            return text.to_string();
        }

        if let Some(content) = &self.content {
            let key = (page_path.to_string(), target_lang.to_string());
            let last_modified = content.page_last_modified(page_path).await;

            if let Some(hit) = self.memo_lookup(&key, last_modified, text).await {
                self.metrics.incr(metric_names::MEMO_HITS);
                return hit;
            }

            let fragments = content.page_fragments(page_path).await;
            if fragments.iter().any(|f| f.source_text == text) {
                let (outcome, stale) = self
                    .run_page(page_path, &fragments, source_lang, target_lang)
                    .await;
                if stale {
                    return text.to_string();
                }
                let shown = outcome
                    .by_text
                    .get(text)
                    .cloned()
                    .unwrap_or_else(|| text.to_string());
                // Fallbacks are memoized too but never replayed
                if let (Some(ts), true) = (last_modified, outcome.complete) {
                    self.memo.lock().insert(
                        key,
                        MemoEntry {
                            last_modified: ts,
                            outcome,
                        },
                    );
                }
                return shown;
            }
        }

        // Text not part of known page content: resolve it alone
        let fingerprint = self
            .orchestrator
            .current_fingerprint(page_path)
            .await
            .unwrap_or_else(|| self.orchestrator.fingerprints().fingerprint(&[]));
        let (shown, resolution) = self
            .orchestrator
            .translate_text(text, source_lang, target_lang, &fingerprint)
            .await;
        debug!(page = page_path, target_lang, ?resolution, "single text resolved");
        shown
    }

    /// Memoized display text, only for texts the memoized pass settled.
    async fn memo_lookup(
        &self,
        key: &PassKey,
        last_modified: Option<i64>,
        text: &str,
    ) -> Option<String> {
        let last_modified = last_modified?;
        let outcome = {
            let memo = self.memo.lock();
            let entry = memo.get(key)?;
            if entry.last_modified != last_modified {
                return None;
            }
            Arc::clone(&entry.outcome)
        };
        let settled = outcome.settled_text(text)?;
        let current = self.orchestrator.current_fingerprint(&key.0).await?;
        if current != outcome.fingerprint {
            return None;
        }
        Some(settled.to_string())
    }
}

impl Drop for TranslationClient {
    fn drop(&mut self) {
        if let Some((shutdown, _handle)) = self.reaper.take() {
            shutdown.cancel();
        }
    }
}
