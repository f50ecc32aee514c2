//! Transport: one HTTP request with auth, retry and content dispatch
//!
//! The transport owns the HTTP client and nothing else. It retries
//! transient failures (connection reset, DNS hiccup, connect timeout,
//! HTTP 429) with exponential backoff, interprets status codes, and
//! dispatches the body by content type. Everything above it works with
//! the decoded `Payload`.

use async_trait::async_trait;
use glidesync_core::{GlideError, InstanceConfig, Result};
use rand::Rng;
use reqwest::Method;
use std::time::Duration;
use url::Url;

/// Hard ceiling on attempts per request (1 initial + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One outbound HTTP call, ready for a backend.
#[derive(Debug, Clone)]
pub struct HttpCall {
    pub method: Method,
    pub url: Url,
    pub body: Option<serde_json::Value>,
}

/// Raw response before content dispatch.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Backend failure, classified for the retry loop.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    /// Connection reset, DNS temporary failure, connect timeout.
    pub retryable: bool,
    pub message: String,
}

impl BackendError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Something that can execute a single HTTP exchange.
///
/// The real implementation is `HttpBackend`; the scripted one backs fake
/// mode and the test suites.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, call: &HttpCall) -> std::result::Result<RawResponse, BackendError>;
}

#[async_trait]
impl<T: Backend> Backend for std::sync::Arc<T> {
    async fn send(&self, call: &HttpCall) -> std::result::Result<RawResponse, BackendError> {
        (**self).send(call).await
    }
}

/// reqwest-based backend with HTTP Basic auth.
pub struct HttpBackend {
    http: reqwest::Client,
    username: Option<String>,
    password: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &InstanceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GlideError::Configuration(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, call: &HttpCall) -> std::result::Result<RawResponse, BackendError> {
        let mut builder = self.http.request(call.method.clone(), call.url.clone());
        if let Some(username) = &self.username {
            builder = builder.basic_auth(username, self.password.as_deref());
        }
        if let Some(body) = &call.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| BackendError {
            // Connect failures cover refused connections and DNS lookup
            // errors; timeouts cover both connect and read deadlines.
            retryable: e.is_connect() || e.is_timeout(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| BackendError {
                retryable: e.is_timeout(),
                message: format!("while reading body: {e}"),
            })?
            .to_vec();

        Ok(RawResponse {
            status,
            content_type,
            body,
        })
    }
}

/// Exponential backoff for the retry loop.
///
/// Delay for attempt `n` (1-based) is `min(cap, base * factor^(n-1))`
/// scaled by a uniform jitter in [0.5, 1.5].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_ms: u64,
    cap_ms: u64,
    factor: f64,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_ms: u64, cap_ms: u64, factor: f64) -> Self {
        Self {
            base_ms: base_ms.max(1),
            cap_ms: cap_ms.max(base_ms),
            factor: factor.max(1.0),
            jitter: true,
        }
    }

    /// Disable jitter for deterministic tests.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following failed attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = (self.base_ms as f64) * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap_ms as f64);
        let scaled = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_millis(scaled as u64)
    }
}

impl Default for RetryPolicy {
    /// 1 s base, 30 s cap, 3x growth.
    fn default() -> Self {
        Self::new(1_000, 30_000, 3.0)
    }
}

/// Decoded response body.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(serde_json::Value),
    /// Raw XML text; the schema module parses it.
    Xml(String),
    /// Attachment file contents.
    Bytes(Vec<u8>),
    /// 201/204 success with no body.
    Empty,
}

/// Executes single requests against the instance.
pub struct Transport {
    backend: Box<dyn Backend>,
    retry: RetryPolicy,
    base: Url,
    username: Option<String>,
    debug: bool,
}

impl Transport {
    pub fn new(config: &InstanceConfig, backend: Box<dyn Backend>) -> Result<Self> {
        let base = Url::parse(&format!("https://{}.service-now.com", config.instance))
            .map_err(|e| GlideError::Configuration(format!("invalid instance URL: {e}")))?;
        Ok(Self {
            backend,
            retry: RetryPolicy::default(),
            base,
            username: config.username.clone(),
            debug: config.debug,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// URL for a JSON API path, rooted at `/api/now`.
    pub fn api_url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = self
            .base
            .join(&format!("/api/now{path}"))
            .map_err(|e| GlideError::Validation(format!("cannot build URL for {path}: {e}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// URL for the XML schema endpoint, rooted at the instance itself.
    pub fn schema_url(&self, table: &str) -> Result<Url> {
        let mut url = self
            .base
            .join(&format!("/{table}.do"))
            .map_err(|e| GlideError::Validation(format!("cannot build schema URL: {e}")))?;
        url.set_query(Some("SCHEMA"));
        Ok(url)
    }

    /// Execute one request with bounded retry and decode the response.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
    ) -> Result<Payload> {
        let call = HttpCall { method, url, body };
        let mut attempt = 1u32;
        loop {
            if self.debug {
                tracing::debug!(method = %call.method, url = %call.url, attempt, "sending request");
            }
            let outcome = self.backend.send(&call).await;
            match outcome {
                Err(error) if error.retryable && attempt < MAX_ATTEMPTS => {
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(
                        method = %call.method,
                        url = %call.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) if error.retryable => {
                    return Err(GlideError::Transport(format!(
                        "Too many retries for {} {}: {error}",
                        call.method, call.url
                    )));
                }
                Err(error) => {
                    return Err(GlideError::Transport(format!(
                        "{} {} failed: {error}",
                        call.method, call.url
                    )));
                }
                Ok(response) if response.status == 429 && attempt < MAX_ATTEMPTS => {
                    let delay = self.retry.delay(attempt);
                    tracing::debug!(
                        method = %call.method,
                        url = %call.url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Ok(response) if response.status == 429 => {
                    return Err(GlideError::Transport(format!(
                        "Too many retries for {} {}: still rate limited",
                        call.method, call.url
                    )));
                }
                Ok(response) => return self.interpret(&call, response),
            }
        }
    }

    /// Turn a terminal response into a payload or an error.
    fn interpret(&self, call: &HttpCall, response: RawResponse) -> Result<Payload> {
        if self.debug {
            tracing::debug!(
                method = %call.method,
                url = %call.url,
                status = response.status,
                bytes = response.body.len(),
                "response received"
            );
        }

        match response.status {
            201 | 204 if response.body.is_empty() => return Ok(Payload::Empty),
            200 | 201 | 204 => {}
            403 => {
                return Err(GlideError::Unauthorised {
                    user: self
                        .username
                        .clone()
                        .unwrap_or_else(|| "anonymous".to_string()),
                    method: call.method.to_string(),
                    url: call.url.to_string(),
                });
            }
            status => {
                return Err(GlideError::Transport(format!(
                    "{} {} returned HTTP {status}: {}",
                    call.method,
                    call.url,
                    snippet(&response.body)
                )));
            }
        }

        if response.body.is_empty() {
            return Err(GlideError::Protocol(format!(
                "{} {} returned HTTP {} with no body",
                call.method, call.url, response.status
            )));
        }

        if response.content_type.starts_with("application/json") {
            let value: serde_json::Value = serde_json::from_slice(&response.body)
                .map_err(|e| GlideError::Protocol(format!("malformed JSON body: {e}")))?;
            if let Some(error) = value.get("error") {
                let message = error
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown error");
                let detail = error
                    .get("detail")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                return Err(GlideError::Protocol(format!("{message}: {detail}")));
            }
            Ok(Payload::Json(value))
        } else if response.content_type.starts_with("text/xml") {
            let text = String::from_utf8(response.body)
                .map_err(|e| GlideError::Protocol(format!("XML body is not UTF-8: {e}")))?;
            Ok(Payload::Xml(text))
        } else {
            Ok(Payload::Bytes(response.body))
        }
    }
}

fn snippet(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.len() > 200 {
        format!("{}…", &trimmed[..200])
    } else {
        trimmed.to_string()
    }
}
