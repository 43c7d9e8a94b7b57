//! Error types for the translation engine.
//! None of these reach the rendering path: `TranslationClient` resolves every
//! failure to the source text and only logs / counts it.

use std::time::Duration;

use thiserror::Error;

use crate::circuit::FailureKind;

/// Error returned by a translation provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Provider signalled throughput exhaustion (HTTP 429 or equivalent).
    #[error("rate limited{}", retry_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// How the circuit tracker should count this failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ProviderError::RateLimited { .. } => FailureKind::RateLimited,
            ProviderError::BadRequest(_)
            | ProviderError::Provider(_)
            | ProviderError::Network(_) => FailureKind::Hard,
        }
    }
}

fn retry_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    /// The blocking task running the store call panicked or was aborted.
    #[error("store task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure while assembling a `TranslationClient`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("provider setup: {0}")]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limit_is_soft() {
        assert_eq!(
            ProviderError::RateLimited { retry_after: None }.failure_kind(),
            FailureKind::RateLimited
        );
        assert_eq!(ProviderError::BadRequest("x".into()).failure_kind(), FailureKind::Hard);
        assert_eq!(ProviderError::Provider("x".into()).failure_kind(), FailureKind::Hard);
        assert_eq!(ProviderError::Network("x".into()).failure_kind(), FailureKind::Hard);
    }

    #[test]
    fn rate_limit_message_includes_retry_after() {
        let e = ProviderError::RateLimited {
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert_eq!(e.to_string(), "rate limited, retry after 1500ms");
        let e = ProviderError::RateLimited { retry_after: None };
        assert_eq!(e.to_string(), "rate limited");
    }
}
