//! Authenticated client for the webharvest control-plane API.
//!
//! [`ApiClient`] turns one logical API call into zero or more physical HTTP
//! attempts: per-attempt credential resolution, a fixed wall-clock deadline,
//! classification of failures, and retry with exponential backoff (or the
//! server's retry-after hint) for idempotent requests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Method;
use url::Url;
use webharvest_core::retry::{RetryPolicy, JITTER_MAX, JITTER_MIN};
use webharvest_core::{classify, ApiError, Error, Result};

pub mod agents;
pub mod analytics;
pub mod auth;
pub mod billing;
pub mod schedules;
pub mod spaces;

pub use auth::CredentialStore;

/// Default per-attempt wall-clock deadline.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: Arc<CredentialStore>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

/// One logical request, before any attempt is made.
#[derive(Debug, Clone)]
pub(crate) struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(&'static str, String)>,
    body: Option<serde_json::Value>,
}

impl RequestSpec {
    pub(crate) fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub(crate) fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub(crate) fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub(crate) fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub(crate) fn query(mut self, pairs: Vec<(&'static str, String)>) -> Self {
        self.query = pairs;
        self
    }

    pub(crate) fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

enum AttemptOutcome {
    Success(serde_json::Value),
    Http {
        error: ApiError,
        retry_after: Option<Duration>,
    },
    Net(reqwest::Error),
}

fn draw_jitter() -> f64 {
    rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX)
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: Url, credentials: Arc<CredentialStore>) -> Self {
        Self {
            http,
            base_url,
            credentials,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The credential store backing this client. The bearer slot can be
    /// replaced through it while requests are in flight.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    fn endpoint_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn attempt_once(
        &self,
        spec: &RequestSpec,
        endpoint: &str,
        authorization: String,
    ) -> AttemptOutcome {
        let mut req = self
            .http
            .request(spec.method.clone(), endpoint)
            .header(AUTHORIZATION, authorization)
            .header(ACCEPT, "application/json");
        if !spec.query.is_empty() {
            req = req.query(&spec.query);
        }
        if let Some(body) = &spec.body {
            req = req.header(CONTENT_TYPE, "application/json").json(body);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => return AttemptOutcome::Net(e),
        };

        let status = resp.status();
        if status.is_success() {
            let text = match resp.text().await {
                Ok(t) => t,
                Err(e) => return AttemptOutcome::Net(e),
            };
            if text.trim().is_empty() {
                return AttemptOutcome::Success(serde_json::Value::Null);
            }
            return match serde_json::from_str(&text) {
                Ok(v) => AttemptOutcome::Success(v),
                Err(e) => AttemptOutcome::Http {
                    error: ApiError {
                        status: status.as_u16(),
                        status_text: status
                            .canonical_reason()
                            .unwrap_or("Unknown")
                            .to_string(),
                        message: format!("unparseable response body: {e}"),
                        endpoint: endpoint.to_string(),
                    },
                    retry_after: None,
                },
            };
        }

        // Read the hint before the body consumes the response.
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| classify::parse_retry_after(v, chrono::Utc::now()))
            .map(Duration::from_secs);
        let status_text = status.canonical_reason().unwrap_or("Unknown").to_string();
        let body = resp.text().await.unwrap_or_default();
        let error = classify::classify(status.as_u16(), &status_text, endpoint, &body);
        AttemptOutcome::Http { error, retry_after }
    }

    /// Execute a logical request to completion: success body, or a terminal
    /// error once the attempt budget is spent.
    pub(crate) async fn execute(&self, spec: RequestSpec) -> Result<serde_json::Value> {
        let endpoint = self.endpoint_for(&spec.path);
        let idempotent = spec.method != Method::POST;
        let attempts = self.retry.attempts_for(idempotent);
        let started = Instant::now();

        let mut attempt = 0u32;
        loop {
            let attempts_remain = attempt + 1 < attempts;
            // Resolved per attempt: a token refresh between attempts is honored.
            let authorization = self.credentials.authorization_header()?;

            let outcome = tokio::time::timeout(
                self.request_timeout,
                self.attempt_once(&spec, &endpoint, authorization),
            )
            .await;

            match outcome {
                Ok(AttemptOutcome::Success(value)) => return Ok(value),
                Ok(AttemptOutcome::Http { error, retry_after }) => {
                    if error.is_unauthorized() || error.is_forbidden() {
                        return Err(Error::Api(error));
                    }
                    if error.is_retryable() && attempts_remain {
                        let delay = self.retry.delay_for(attempt, retry_after, draw_jitter());
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(if error.is_rate_limited() {
                        Error::RateLimited { error, retry_after }
                    } else {
                        Error::Api(error)
                    });
                }
                Ok(AttemptOutcome::Net(e)) => {
                    if attempts_remain {
                        let delay = self.retry.delay_for(attempt, None, draw_jitter());
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::Transport(e.to_string()));
                }
                Err(_elapsed) => {
                    if attempts_remain {
                        let delay = self.retry.delay_for(attempt, None, draw_jitter());
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(Error::Timeout {
                        endpoint,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    }
}
