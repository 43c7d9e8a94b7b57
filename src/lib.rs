//! lingosync: content-fingerprinted translation sync and caching for
//! multilingual pages.
//!
//! Rendering code talks to [`TranslationClient`]. Behind it a page pass
//! fingerprints the page, drops cached translations written for older
//! content, and sends only the texts still missing to the translation
//! provider, in small concurrent batches with per-text circuit breaking.

pub mod cancellation;
pub mod circuit;
pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod fingerprint;
pub mod inflight;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod translate;

pub use circuit::{CircuitState, CircuitTracker, FailureKind};
pub use client::{ClientBuilder, PageTranslation, TranslationClient};
pub use config::{EngineConfig, ProviderConfig};
pub use content::{ContentProvider, StaticContent};
pub use error::{BuildError, ConfigError, ProviderError, StoreError};
pub use fingerprint::{text_hash, FingerprintEngine, FragmentHasher};
pub use model::{FragmentRole, LanguageProfile, LanguageSet, PageFingerprint, TextFragment};
pub use orchestrator::{PassStats, Resolution};
pub use translate::store::{MemoryStore, TranslationStore};
pub use translate::sqlite_store::SqliteStore;
pub use translate::{ProviderRequest, TranslationProvider};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `lingosync=debug` filter; `LINGOSYNC_LOG_FORMAT=json` switches to JSON
/// lines. Does nothing if a subscriber is already set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lingosync=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let json = std::env::var("LINGOSYNC_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if result.is_ok() {
        tracing::info!("lingosync tracing initialized");
    }
}
