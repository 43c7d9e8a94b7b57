//! Page translation pass: fingerprint → invalidate on drift → dedupe texts →
//! fixed-size batches (sequential) with bounded concurrent provider calls
//! inside each batch → fall back to source text for anything unresolved.
//!
//! Per-text resolution order:
//! 1. untranslatable text resolves to itself
//! 2. ephemeral cache (carried forward into the store under a new fingerprint)
//! 3. durable store under the current fingerprint
//! 4. circuit check; open → source text, no provider call
//! 5. provider call; success is written to both caches, a rate limit waits
//!    the cooldown and falls back, a hard failure spends retry budget and
//!    falls back

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::circuit::{CircuitTracker, FailureKind};
use crate::config::EngineConfig;
use crate::error::{ProviderError, StoreError};
use crate::fingerprint::{text_hash, FingerprintEngine};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::model::TextFragment;
use crate::translate::cache::EphemeralCache;
use crate::translate::normalize::{needs_translation, PlaceholderProtector};
use crate::translate::store::TranslationStore;
use crate::translate::{ProviderRequest, TranslationProvider};

/// How one distinct text was resolved in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Resolution {
    Untranslatable,
    Ephemeral,
    Stored,
    Translated,
    CircuitOpen,
    RateLimited,
    Failed,
    /// Batch never ran because the pass was cancelled.
    Cancelled,
}

impl Resolution {
    /// True when the returned text is an actual translation.
    pub fn is_translation(self) -> bool {
        matches!(
            self,
            Resolution::Ephemeral | Resolution::Stored | Resolution::Translated
        )
    }

    /// True when another pass would show the same text: an actual
    /// translation, or text that never needs one.
    pub fn is_settled(self) -> bool {
        self.is_translation() || self == Resolution::Untranslatable
    }

    fn reached_provider(self) -> bool {
        matches!(
            self,
            Resolution::Translated | Resolution::RateLimited | Resolution::Failed
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub fragments: usize,
    pub distinct_texts: usize,
    pub batches_run: usize,
    pub untranslatable: usize,
    pub ephemeral_hits: usize,
    pub store_hits: usize,
    pub provider_calls: usize,
    pub translated: usize,
    pub circuit_skipped: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl PassStats {
    fn count(&mut self, resolution: Resolution) {
        if resolution.reached_provider() {
            self.provider_calls += 1;
        }
        match resolution {
            Resolution::Untranslatable => self.untranslatable += 1,
            Resolution::Ephemeral => self.ephemeral_hits += 1,
            Resolution::Stored => self.store_hits += 1,
            Resolution::Translated => self.translated += 1,
            Resolution::CircuitOpen => self.circuit_skipped += 1,
            Resolution::RateLimited => self.rate_limited += 1,
            Resolution::Failed => self.failed += 1,
            Resolution::Cancelled => self.cancelled += 1,
        }
    }

    /// Distinct texts displayed in the source language because translation
    /// was unavailable this pass.
    pub fn fallbacks(&self) -> usize {
        self.circuit_skipped + self.rate_limited + self.failed + self.cancelled
    }
}

/// Result of one page pass, keyed by source text.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub pass_id: String,
    pub page_path: String,
    pub source_lang: String,
    pub target_lang: String,
    pub fingerprint: String,
    /// Every distinct source text of the pass → displayed text.
    pub by_text: HashMap<String, String>,
    /// How each distinct source text was resolved.
    pub resolutions: HashMap<String, Resolution>,
    pub stats: PassStats,
    /// False when cancellation skipped one or more batches.
    pub complete: bool,
}

impl PassOutcome {
    /// Fragment id → displayed text. Fragments whose text this pass did not
    /// resolve keep their source text.
    pub fn mapping_for(&self, fragments: &[TextFragment]) -> HashMap<String, String> {
        fragments
            .iter()
            .map(|f| {
                let text = self
                    .by_text
                    .get(&f.source_text)
                    .cloned()
                    .unwrap_or_else(|| f.source_text.clone());
                (f.id.clone(), text)
            })
            .collect()
    }

    /// Displayed text for `text` if this pass settled it. Fallbacks (rate
    /// limit, failure, open circuit, cancellation) only hold for the pass
    /// that produced them, so they read as `None`.
    pub fn settled_text(&self, text: &str) -> Option<&str> {
        self.resolutions
            .get(text)
            .filter(|r| r.is_settled())
            .and_then(|_| self.by_text.get(text))
            .map(String::as_str)
    }
}

/// Identity mapping: every fragment shows its source text.
pub fn identity_mapping(fragments: &[TextFragment]) -> HashMap<String, String> {
    fragments
        .iter()
        .map(|f| (f.id.clone(), f.source_text.clone()))
        .collect()
}

/// Longest `Retry-After` a rate-limited text will wait inside a pass.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(30);

pub struct BatchOrchestrator {
    provider: Arc<dyn TranslationProvider>,
    store: Arc<dyn TranslationStore>,
    ephemeral: Arc<EphemeralCache>,
    circuit: Arc<CircuitTracker>,
    fingerprints: FingerprintEngine,
    metrics: Arc<MetricsRegistry>,
    protector: PlaceholderProtector,
    batch_size: usize,
    concurrency: usize,
    cooldown: Duration,
}

impl BatchOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn TranslationProvider>,
        store: Arc<dyn TranslationStore>,
        ephemeral: Arc<EphemeralCache>,
        circuit: Arc<CircuitTracker>,
        fingerprints: FingerprintEngine,
        metrics: Arc<MetricsRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider,
            store,
            ephemeral,
            circuit,
            fingerprints,
            metrics,
            protector: PlaceholderProtector::new(),
            batch_size: config.batch_size.max(1),
            concurrency: config.concurrency(),
            cooldown: config.cooldown(),
        }
    }

    pub fn fingerprints(&self) -> &FingerprintEngine {
        &self.fingerprints
    }

    pub fn store(&self) -> &Arc<dyn TranslationStore> {
        &self.store
    }

    pub fn circuit(&self) -> &Arc<CircuitTracker> {
        &self.circuit
    }

    /// Run a store operation on the blocking pool.
    async fn store_call<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn TranslationStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || op(store.as_ref())).await?
    }

    /// Stored current fingerprint hash of a page; store errors read as unknown.
    pub async fn current_fingerprint(&self, page_path: &str) -> Option<String> {
        let page = page_path.to_string();
        match self
            .store_call(move |store| store.current_fingerprint(&page))
            .await
        {
            Ok(fp) => fp.map(|f| f.hash),
            Err(e) => {
                self.metrics.incr(metric_names::STORE_ERRORS);
                warn!(page = page_path, error = %e, "fingerprint lookup failed");
                None
            }
        }
    }

    /// Translate every fragment of a page. Never fails: unresolved texts map
    /// to themselves. Cancellation lets the running batch finish and skips
    /// the rest.
    pub async fn translate_page(
        self: &Arc<Self>,
        page_path: &str,
        fragments: &[TextFragment],
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> PassOutcome {
        let pass_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("page_pass", pass_id = %pass_id, page = page_path, target_lang);
        self.run_pass(pass_id, page_path, fragments, source_lang, target_lang, cancel)
            .instrument(span)
            .await
    }

    async fn run_pass(
        self: &Arc<Self>,
        pass_id: String,
        page_path: &str,
        fragments: &[TextFragment],
        source_lang: &str,
        target_lang: &str,
        cancel: &CancellationToken,
    ) -> PassOutcome {
        let timer = self.metrics.span(metric_names::PAGE_PASS);
        self.metrics.incr(metric_names::PASSES);

        let current = self.fingerprints.page_fingerprint(page_path, fragments);
        let stored = self.current_fingerprint(page_path).await;
        if stored.as_deref() != Some(current.hash.as_str()) {
            let (page, next) = (page_path.to_string(), current.clone());
            match self
                .store_call(move |store| store.invalidate_page(&page, &next))
                .await
            {
                Ok(()) => {
                    self.metrics.incr(metric_names::PAGES_INVALIDATED);
                    info!(
                        previous = stored.as_deref().unwrap_or("none"),
                        fingerprint = %current.hash,
                        "page fingerprint advanced"
                    );
                }
                Err(e) => {
                    self.metrics.incr(metric_names::STORE_ERRORS);
                    warn!(error = %e, "failed to record page fingerprint");
                }
            }
        }
        let fingerprint = current.hash;

        // Dedupe, keeping first-occurrence order
        let mut seen = HashSet::new();
        let distinct: Vec<String> = fragments
            .iter()
            .filter(|f| seen.insert(f.source_text.as_str()))
            .map(|f| f.source_text.clone())
            .collect();

        let mut stats = PassStats {
            fragments: fragments.len(),
            distinct_texts: distinct.len(),
            ..PassStats::default()
        };
        let mut by_text = HashMap::with_capacity(distinct.len());
        let mut resolutions = HashMap::with_capacity(distinct.len());
        let mut complete = true;

        for (idx, batch) in distinct.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                complete = false;
                for text in batch {
                    by_text.insert(text.clone(), text.clone());
                    resolutions.insert(text.clone(), Resolution::Cancelled);
                    stats.count(Resolution::Cancelled);
                }
                continue;
            }

            debug!(batch = idx, size = batch.len(), "dispatching batch");
            stats.batches_run += 1;
            for (text, shown, resolution) in self
                .run_batch(batch, source_lang, target_lang, &fingerprint, cancel)
                .await
            {
                resolutions.insert(text.clone(), resolution);
                by_text.insert(text, shown);
                stats.count(resolution);
            }
        }

        if !complete {
            info!(skipped = stats.cancelled, "pass cancelled, remaining batches skipped");
        }

        let elapsed_us = timer.finish();
        info!(
            fragments = stats.fragments,
            distinct = stats.distinct_texts,
            provider_calls = stats.provider_calls,
            fallbacks = stats.fallbacks(),
            elapsed_ms = (elapsed_us / 1000.0) as u64,
            "page pass done"
        );

        PassOutcome {
            pass_id,
            page_path: page_path.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            fingerprint,
            by_text,
            resolutions,
            stats,
            complete,
        }
    }

    /// Resolve one batch concurrently and wait for all of it.
    async fn run_batch(
        self: &Arc<Self>,
        batch: &[String],
        source_lang: &str,
        target_lang: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> Vec<(String, String, Resolution)> {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for text in batch {
            let this = Arc::clone(self);
            let permits = Arc::clone(&permits);
            let text = text.clone();
            let source_lang = source_lang.to_string();
            let target_lang = target_lang.to_string();
            let fingerprint = fingerprint.to_string();
            let cancel = cancel.clone();
            tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await;
                    let (shown, resolution) = this
                        .resolve(&text, &source_lang, &target_lang, &fingerprint, &cancel)
                        .await;
                    (text, shown, resolution)
                }
                .in_current_span(),
            );
        }

        let mut results = Vec::with_capacity(batch.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(r) => results.push(r),
                // Text stays out of the outcome and falls back to source
                Err(e) => error!(error = %e, "translation task panicked"),
            }
        }
        results
    }

    /// Resolve a single text under a given page fingerprint.
    pub async fn translate_text(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        fingerprint: &str,
    ) -> (String, Resolution) {
        self.resolve(text, source_lang, target_lang, fingerprint, &CancellationToken::new())
            .await
    }

    async fn resolve(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
    ) -> (String, Resolution) {
        if !needs_translation(text) {
            return (text.to_string(), Resolution::Untranslatable);
        }
        let th = text_hash(text);

        if let Some(hit) = self.ephemeral.get(source_lang, target_lang, &th) {
            self.metrics.incr(metric_names::EPHEMERAL_HITS);
            if hit.fingerprint != fingerprint {
                self.carry_forward(source_lang, target_lang, &th, &hit.translated_text, fingerprint)
                    .await;
            }
            return (hit.translated_text, Resolution::Ephemeral);
        }

        let lookup = {
            let (src, tgt, key, fp) = (
                source_lang.to_string(),
                target_lang.to_string(),
                th.clone(),
                fingerprint.to_string(),
            );
            self.store_call(move |store| store.get(&src, &tgt, &key, &fp))
                .await
        };
        match lookup {
            Ok(Some(entry)) => {
                self.metrics.incr(metric_names::STORE_HITS);
                self.ephemeral.insert(
                    source_lang,
                    target_lang,
                    &th,
                    entry.translated_text.clone(),
                    fingerprint,
                );
                return (entry.translated_text, Resolution::Stored);
            }
            Ok(None) => {}
            Err(e) => {
                self.metrics.incr(metric_names::STORE_ERRORS);
                warn!(text_hash = %th, error = %e, "store lookup failed, treating as miss");
            }
        }

        if !self.circuit.should_attempt(&th, target_lang, fingerprint) {
            self.metrics.incr(metric_names::CIRCUIT_SKIPPED);
            debug!(text_hash = %th, "circuit open, showing source text");
            return (text.to_string(), Resolution::CircuitOpen);
        }

        let (protected, placeholders) = self.protector.protect(text);
        let request = ProviderRequest::new(&protected, source_lang, target_lang);

        self.metrics.incr(metric_names::PROVIDER_CALLS);
        let timer = self.metrics.span(metric_names::PROVIDER_CALL);
        let result = self.provider.translate(&request).await;
        timer.finish();

        match result {
            Ok(raw) => {
                let translated = self.protector.restore(&raw, &placeholders);
                self.metrics.incr(metric_names::PROVIDER_OK);
                if let Err(e) = self
                    .persist(source_lang, target_lang, &th, &translated, fingerprint)
                    .await
                {
                    self.metrics.incr(metric_names::STORE_ERRORS);
                    warn!(text_hash = %th, error = %e, "store write failed");
                }
                self.circuit.record_success(&th, target_lang);
                self.ephemeral
                    .insert(source_lang, target_lang, &th, translated.clone(), fingerprint);
                (translated, Resolution::Translated)
            }
            Err(e) if e.failure_kind() == FailureKind::RateLimited => {
                self.metrics.incr(metric_names::RATE_LIMITED);
                self.circuit
                    .record_failure(&th, target_lang, fingerprint, FailureKind::RateLimited);
                let cooldown = self.cooldown_for(&e);
                warn!(
                    text_hash = %th,
                    error = %e,
                    cooldown_ms = cooldown.as_millis() as u64,
                    "provider rate limited, cooling down"
                );
                tokio::select! {
                    _ = tokio::time::sleep(cooldown) => {}
                    _ = cancel.cancelled() => {}
                }
                (text.to_string(), Resolution::RateLimited)
            }
            Err(e) => {
                self.metrics.incr(metric_names::PROVIDER_FAILED);
                let state = self
                    .circuit
                    .record_failure(&th, target_lang, fingerprint, FailureKind::Hard);
                warn!(text_hash = %th, error = %e, circuit = %state, "translation failed, showing source text");
                (text.to_string(), Resolution::Failed)
            }
        }
    }

    /// Configured cooldown, stretched to the provider's `Retry-After` when
    /// that is longer (capped at `MAX_RETRY_AFTER`).
    fn cooldown_for(&self, err: &ProviderError) -> Duration {
        match err {
            ProviderError::RateLimited {
                retry_after: Some(wait),
            } => (*wait).min(MAX_RETRY_AFTER).max(self.cooldown),
            _ => self.cooldown,
        }
    }

    async fn persist(
        &self,
        source_lang: &str,
        target_lang: &str,
        th: &str,
        translated: &str,
        fingerprint: &str,
    ) -> Result<(), StoreError> {
        let (src, tgt, key, text, fp) = (
            source_lang.to_string(),
            target_lang.to_string(),
            th.to_string(),
            translated.to_string(),
            fingerprint.to_string(),
        );
        self.store_call(move |store| store.put(&src, &tgt, &key, &text, &fp))
            .await
    }

    /// Re-persist an ephemeral translation under the page's new fingerprint.
    async fn carry_forward(
        &self,
        source_lang: &str,
        target_lang: &str,
        th: &str,
        translated: &str,
        fingerprint: &str,
    ) {
        match self
            .persist(source_lang, target_lang, th, translated, fingerprint)
            .await
        {
            Ok(()) => self.ephemeral.retag(source_lang, target_lang, th, fingerprint),
            Err(e) => {
                self.metrics.incr(metric_names::STORE_ERRORS);
                warn!(text_hash = th, error = %e, "carry-forward write failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::translate::store::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider stub: fixed dictionary, scripted errors, call log.
    #[derive(Default)]
    pub(crate) struct StubProvider {
        dictionary: HashMap<String, String>,
        scripted: Mutex<HashMap<String, Vec<ProviderError>>>,
        pub calls: AtomicUsize,
        pub log: Mutex<Vec<String>>,
        delay: Duration,
        in_flight: AtomicUsize,
        pub peak: AtomicUsize,
    }

    impl StubProvider {
        pub(crate) fn with(pairs: &[(&str, &str)]) -> Self {
            Self {
                dictionary: pairs
                    .iter()
                    .map(|(s, t)| (s.to_string(), t.to_string()))
                    .collect(),
                ..Self::default()
            }
        }

        pub(crate) fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Queue errors returned (in order) before the text succeeds.
        pub(crate) fn fail_with(self, text: &str, errors: Vec<ProviderError>) -> Self {
            self.scripted.lock().insert(text.to_string(), errors);
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn calls_for(&self, text: &str) -> usize {
            self.log.lock().iter().filter(|t| t.as_str() == text).count()
        }
    }

    #[async_trait]
    impl TranslationProvider for StubProvider {
        async fn translate(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(request.text.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let scripted = {
                let mut scripted = self.scripted.lock();
                scripted.get_mut(&request.text).and_then(|q| {
                    if q.is_empty() {
                        None
                    } else {
                        Some(q.remove(0))
                    }
                })
            };
            if let Some(err) = scripted {
                return Err(err);
            }
            Ok(self
                .dictionary
                .get(&request.text)
                .cloned()
                .unwrap_or_else(|| format!("[{}] {}", request.target_lang, request.text)))
        }
    }

    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            rate_limit_cooldown_ms: 10,
            ..EngineConfig::default()
        }
    }

    fn orchestrator(provider: Arc<StubProvider>, config: &EngineConfig) -> Arc<BatchOrchestrator> {
        Arc::new(BatchOrchestrator::new(
            provider,
            Arc::new(MemoryStore::new()),
            Arc::new(EphemeralCache::new(64, Duration::from_secs(60))),
            Arc::new(CircuitTracker::new(config.max_retries)),
            FingerprintEngine::default(),
            Arc::new(MetricsRegistry::new()),
            config,
        ))
    }

    fn frags(texts: &[&str]) -> Vec<TextFragment> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| TextFragment::body(format!("frag{}", i + 1), *t))
            .collect()
    }

    #[tokio::test]
    async fn translates_and_maps_every_fragment() {
        let provider = Arc::new(StubProvider::with(&[("首頁", "Home"), ("關於我們", "About Us")]));
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let fragments = frags(&["首頁", "關於我們", "2024"]);

        let outcome = orch
            .translate_page("home", &fragments, "zh-TW", "en", &CancellationToken::new())
            .await;
        let mapping = outcome.mapping_for(&fragments);

        assert_eq!(mapping["frag1"], "Home");
        assert_eq!(mapping["frag2"], "About Us");
        assert_eq!(mapping["frag3"], "2024");
        assert_eq!(provider.calls(), 2);
        assert_eq!(outcome.stats.untranslatable, 1);
        assert!(outcome.complete);
        assert_eq!(
            orch.current_fingerprint("home").await,
            Some(outcome.fingerprint.clone())
        );
    }

    #[tokio::test]
    async fn duplicates_translate_once() {
        let provider = Arc::new(StubProvider::with(&[("購物車", "Cart")]));
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let fragments = frags(&["購物車", "購物車"]);

        let outcome = orch
            .translate_page("cart", &fragments, "zh-TW", "en", &CancellationToken::new())
            .await;
        let mapping = outcome.mapping_for(&fragments);

        assert_eq!(provider.calls(), 1);
        assert_eq!(mapping["frag1"], "Cart");
        assert_eq!(mapping["frag2"], "Cart");
        assert_eq!(outcome.stats.distinct_texts, 1);
    }

    #[tokio::test]
    async fn batches_are_sequential_and_bounded() {
        let provider = Arc::new(StubProvider::default().delayed(Duration::from_millis(20)));
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let texts: Vec<String> = (0..12).map(|i| format!("商品{i}")).collect();
        let fragments: Vec<TextFragment> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| TextFragment::body(format!("f{i}"), t.as_str()))
            .collect();

        let outcome = orch
            .translate_page("shop", &fragments, "zh-TW", "en", &CancellationToken::new())
            .await;

        assert_eq!(provider.calls(), 12);
        assert_eq!(outcome.stats.batches_run, 3);
        assert_eq!(provider.peak.load(Ordering::SeqCst), 5);

        // Every text of batch N is sent before any text of batch N+1
        let log = provider.log.lock().clone();
        for (batch_idx, batch) in texts.chunks(5).enumerate() {
            for text in batch {
                let pos = log.iter().position(|t| t == text).unwrap();
                assert!(pos / 5 == batch_idx, "{text} dispatched out of batch order");
            }
        }
    }

    #[tokio::test]
    async fn hard_failures_open_circuit() {
        let provider = Arc::new(StubProvider::with(&[("壞掉", "Broken")]).fail_with(
            "壞掉",
            vec![
                ProviderError::Provider("boom".into()),
                ProviderError::Network("reset".into()),
            ],
        ));
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let fragments = frags(&["壞掉"]);
        let token = CancellationToken::new();

        for _ in 0..2 {
            let outcome = orch.translate_page("p", &fragments, "zh-TW", "en", &token).await;
            assert_eq!(outcome.by_text["壞掉"], "壞掉");
            assert_eq!(outcome.stats.failed, 1);
        }
        assert_eq!(provider.calls(), 2);

        let outcome = orch.translate_page("p", &fragments, "zh-TW", "en", &token).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(outcome.stats.circuit_skipped, 1);
        assert_eq!(outcome.by_text["壞掉"], "壞掉");
    }

    #[tokio::test]
    async fn rate_limit_does_not_open_circuit() {
        let rate_limited = || ProviderError::RateLimited { retry_after: None };
        let provider = Arc::new(
            StubProvider::with(&[("忙碌", "Busy")])
                .fail_with("忙碌", vec![rate_limited(), rate_limited(), rate_limited()]),
        );
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let fragments = frags(&["忙碌"]);
        let token = CancellationToken::new();

        for _ in 0..3 {
            let outcome = orch.translate_page("p", &fragments, "zh-TW", "en", &token).await;
            assert_eq!(outcome.by_text["忙碌"], "忙碌");
            assert_eq!(outcome.stats.rate_limited, 1);
        }
        let outcome = orch.translate_page("p", &fragments, "zh-TW", "en", &token).await;
        assert_eq!(outcome.by_text["忙碌"], "Busy");
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn retry_after_stretches_cooldown() {
        let provider = Arc::new(StubProvider::default().fail_with(
            "忙碌",
            vec![ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(80)),
            }],
        ));
        let orch = orchestrator(Arc::clone(&provider), &test_config());

        let started = std::time::Instant::now();
        let (shown, resolution) = orch.translate_text("忙碌", "zh-TW", "en", "H").await;
        assert_eq!(resolution, Resolution::RateLimited);
        assert_eq!(shown, "忙碌");
        assert!(started.elapsed() >= Duration::from_millis(80));

        let huge = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(orch.cooldown_for(&huge), MAX_RETRY_AFTER);
        let short = ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(1)),
        };
        assert_eq!(orch.cooldown_for(&short), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancelled_pass_skips_remaining_batches() {
        let provider = Arc::new(StubProvider::default().delayed(Duration::from_millis(30)));
        let mut config = test_config();
        config.batch_size = 2;
        let orch = orchestrator(Arc::clone(&provider), &config);
        let fragments = frags(&["一", "二", "三", "四", "五"]);
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                token.cancel();
            })
        };
        let outcome = orch.translate_page("p", &fragments, "zh-TW", "en", &token).await;
        canceller.await.unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.stats.batches_run, 1);
        assert_eq!(provider.calls(), 2);
        assert_eq!(outcome.stats.cancelled, 3);
        let mapping = outcome.mapping_for(&fragments);
        assert_eq!(mapping["frag1"], "[en] 一");
        assert_eq!(mapping["frag5"], "五");
    }

    /// Records which thread each store call ran on.
    #[derive(Default)]
    struct ThreadRecordingStore {
        inner: MemoryStore,
        threads: Mutex<Vec<std::thread::ThreadId>>,
    }

    impl ThreadRecordingStore {
        fn note(&self) {
            self.threads.lock().push(std::thread::current().id());
        }
    }

    impl TranslationStore for ThreadRecordingStore {
        fn get(
            &self,
            source_lang: &str,
            target_lang: &str,
            text_hash: &str,
            current_fingerprint: &str,
        ) -> Result<Option<crate::model::CacheEntry>, StoreError> {
            self.note();
            self.inner.get(source_lang, target_lang, text_hash, current_fingerprint)
        }

        fn put(
            &self,
            source_lang: &str,
            target_lang: &str,
            text_hash: &str,
            translated_text: &str,
            fingerprint: &str,
        ) -> Result<(), StoreError> {
            self.note();
            self.inner
                .put(source_lang, target_lang, text_hash, translated_text, fingerprint)
        }

        fn current_fingerprint(
            &self,
            page_path: &str,
        ) -> Result<Option<crate::model::PageFingerprint>, StoreError> {
            self.note();
            self.inner.current_fingerprint(page_path)
        }

        fn invalidate_page(
            &self,
            page_path: &str,
            next: &crate::model::PageFingerprint,
        ) -> Result<(), StoreError> {
            self.note();
            self.inner.invalidate_page(page_path, next)
        }

        fn reap_stale(&self, max_age: Duration) -> Result<usize, StoreError> {
            self.inner.reap_stale(max_age)
        }
    }

    #[tokio::test]
    async fn store_calls_run_off_the_runtime_thread() {
        let provider = Arc::new(StubProvider::with(&[("首頁", "Home")]));
        let store = Arc::new(ThreadRecordingStore::default());
        let config = test_config();
        let orch = Arc::new(BatchOrchestrator::new(
            provider,
            store.clone(),
            Arc::new(EphemeralCache::new(64, Duration::from_secs(60))),
            Arc::new(CircuitTracker::new(config.max_retries)),
            FingerprintEngine::default(),
            Arc::new(MetricsRegistry::new()),
            &config,
        ));

        let outcome = orch
            .translate_page("home", &frags(&["首頁"]), "zh-TW", "en", &CancellationToken::new())
            .await;
        assert_eq!(outcome.by_text["首頁"], "Home");

        let runtime_thread = std::thread::current().id();
        let threads = store.threads.lock();
        // fingerprint read, invalidate, get, put
        assert!(threads.len() >= 4);
        assert!(threads.iter().all(|t| *t != runtime_thread));
    }

    #[tokio::test]
    async fn placeholders_survive_translation() {
        let provider = Arc::new(StubProvider::default());
        let orch = orchestrator(Arc::clone(&provider), &test_config());
        let (shown, resolution) = orch
            .translate_text("請寄信至 help@example.com", "zh-TW", "en", "H")
            .await;
        assert_eq!(resolution, Resolution::Translated);
        assert_eq!(provider.log.lock()[0], "請寄信至 <<PH0>>");
        assert_eq!(shown, "[en] 請寄信至 help@example.com");
    }
}
