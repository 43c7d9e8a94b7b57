//! Translation provider interface and the caching layers in front of it.

pub mod cache;
pub mod http;
pub mod normalize;
pub mod sqlite_store;
pub mod store;

use async_trait::async_trait;
use serde::Serialize;

pub use crate::error::ProviderError;

/// One provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

impl ProviderRequest {
    pub fn new(text: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            text: text.to_string(),
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
        }
    }
}

/// Remote machine translation: `(text, source, target) → translated text`.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(&self, request: &ProviderRequest) -> Result<String, ProviderError>;
}
