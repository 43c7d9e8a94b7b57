//! HTTP translation provider speaking the LibreTranslate JSON shape:
//! `POST {base_url}/translate {q, source, target, api_key?}` → `{translatedText}`.
//! Connection pooling via reqwest and a simple token-bucket request spacing.
//! No retries here: the orchestrator owns cooldown and retry budgeting, so
//! every response is classified and returned as-is.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ProviderError, ProviderRequest, TranslationProvider};
use crate::config::ProviderConfig;

pub struct HttpProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    endpoint: String,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    /// Minimum interval between requests (e.g. 100ms = 10 req/s).
    min_interval: Duration,
}

#[derive(Debug, Serialize)]
struct TranslateBody<'a> {
    q: &'a str,
    source: &'a str,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<&'a str>,
    format: &'static str,
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    #[serde(rename = "translatedText")]
    translated_text: String,
}

impl HttpProvider {
    /// Build a client from config. The API key, if any, is read from the
    /// environment variable named by `api_key_env`.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty());

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Provider(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/translate", config.base_url.trim_end_matches('/')),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: Duration::from_millis(config.min_interval_ms),
        })
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }
}

#[async_trait]
impl TranslationProvider for HttpProvider {
    async fn translate(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        self.rate_limit_wait().await;

        let body = TranslateBody {
            q: &request.text,
            source: &request.source_lang,
            target: &request.target_lang,
            api_key: self.api_key.as_deref(),
            format: "text",
        };

        let start = Instant::now();
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body_text = resp.text().await.unwrap_or_default();
            let err = classify_status(status, retry_after, &body_text);
            warn!(status = status.as_u16(), error = %err, "translation provider rejected request");
            return Err(err);
        }

        let parsed: TranslateResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Provider(format!("malformed response: {e}")))?;

        debug!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = parsed.translated_text.chars().count(),
            "provider call ok"
        );

        if parsed.translated_text.trim().is_empty() && !request.text.trim().is_empty() {
            return Err(ProviderError::Provider("empty translation".into()));
        }
        Ok(parsed.translated_text)
    }
}

/// `Retry-After` in delay-seconds form.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Map a non-success HTTP status to the provider error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ProviderError {
    let snippet: String = body.chars().take(200).collect();
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
            ProviderError::BadRequest(format!("{status}: {snippet}"))
        }
        s => ProviderError::Provider(format!("unexpected status {s}: {snippet}")),
    }
}
