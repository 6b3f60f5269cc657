use std::time::Duration;

pub mod classify;
pub mod retry;

/// Terminal error surface for upstream API calls.
///
/// Recoverable conditions (retryable statuses, timeouts, network errors) are
/// retried inside the executor and only reach callers once the attempt budget
/// is exhausted.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No credential is configured at all. Retrying cannot help.
    #[error("authentication required: {0}")]
    Authentication(String),
    /// Terminal HTTP failure from the upstream API.
    #[error("{0}")]
    Api(ApiError),
    /// HTTP 429, with the server's retry-after hint when it sent one.
    #[error("rate limited: {error}")]
    RateLimited {
        error: ApiError,
        retry_after: Option<Duration>,
    },
    /// The per-attempt deadline expired before the dispatch completed.
    #[error("request to {endpoint} timed out after {elapsed_ms}ms")]
    Timeout { endpoint: String, elapsed_ms: u64 },
    /// Network-level failure (DNS, TLS, connection reset, bad body).
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A classified non-2xx response from the upstream API.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ApiError {
    pub status: u16,
    pub status_text: String,
    pub message: String,
    /// Full URL of the endpoint that produced the failure.
    pub endpoint: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} from {}: {}", self.status, self.endpoint, self.message)
    }
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    pub fn is_forbidden(&self) -> bool {
        self.status == 403
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// Statuses worth retrying. 401/403 are excluded: repeating the request
    /// cannot change an authorization decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self.status, 429 | 502 | 503 | 504)
    }
}

impl Error {
    /// Upstream status code, when this error carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Api(e) => Some(e.status),
            Error::RateLimited { error, .. } => Some(error.status),
            _ => None,
        }
    }

    /// Server-provided retry-after hint, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
