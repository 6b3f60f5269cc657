//! Stable result envelope for tool payloads.
//!
//! Every tool returns `{schema_version, kind, elapsed_ms, ok, ...}`; failures
//! add `error: {code, message, hint, retryable}` so clients can branch on a
//! small, stable set of codes instead of parsing prose.

use serde::Serialize;
use webharvest_core::Error;

pub(crate) const SCHEMA_VERSION: u64 = 1;

#[derive(Clone, Copy, Debug)]
pub(crate) enum ErrorCode {
    InvalidParams,
    NotConfigured,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    ApiError,
    UpstreamError,
    Timeout,
    NetworkError,
    Capacity,
    UnexpectedError,
}

impl ErrorCode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParams => "invalid_params",
            Self::NotConfigured => "not_configured",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::RateLimited => "rate_limited",
            Self::ApiError => "api_error",
            Self::UpstreamError => "upstream_error",
            Self::Timeout => "timeout",
            Self::NetworkError => "network_error",
            Self::Capacity => "capacity",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    pub(crate) fn retryable(self) -> bool {
        match self {
            Self::RateLimited | Self::UpstreamError | Self::Timeout | Self::NetworkError
            | Self::Capacity => true,
            // Bad input or a configuration/authorization problem will not fix
            // itself on retry.
            Self::InvalidParams | Self::NotConfigured | Self::Unauthorized | Self::Forbidden
            | Self::NotFound | Self::ApiError | Self::UnexpectedError => false,
        }
    }
}

pub(crate) fn error_obj(
    code: ErrorCode,
    message: impl ToString,
    hint: impl ToString,
) -> serde_json::Value {
    #[derive(Serialize)]
    struct ErrorObject {
        code: &'static str,
        message: String,
        hint: String,
        retryable: bool,
    }

    let e = ErrorObject {
        code: code.as_str(),
        message: message.to_string(),
        hint: hint.to_string(),
        retryable: code.retryable(),
    };
    match serde_json::to_value(e) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "code": code.as_str(),
            "message": message.to_string(),
            "hint": hint.to_string(),
            "retryable": code.retryable()
        }),
    }
}

pub(crate) fn add_envelope_fields(payload: &mut serde_json::Value, kind: &str, elapsed_ms: u128) {
    payload["schema_version"] = serde_json::json!(SCHEMA_VERSION);
    payload["kind"] = serde_json::json!(kind);
    payload["elapsed_ms"] = serde_json::json!(elapsed_ms);
}

/// Map an upstream client error to a caller-facing category. The message is
/// already bounded by the classifier; the hint gives the caller something
/// actionable.
pub(crate) fn upstream_error(e: &Error) -> serde_json::Value {
    match e {
        Error::Authentication(m) => error_obj(
            ErrorCode::NotConfigured,
            m,
            "Set WEBHARVEST_API_KEY or connect with a bearer token.",
        ),
        Error::RateLimited { error, retry_after } => {
            let hint = match retry_after {
                Some(d) => format!("Rate limited; wait {} seconds before retrying.", d.as_secs()),
                None => "Rate limited; wait before retrying.".to_string(),
            };
            error_obj(ErrorCode::RateLimited, &error.message, hint)
        }
        Error::Api(err) if err.is_unauthorized() => error_obj(
            ErrorCode::Unauthorized,
            &err.message,
            "Check that the API key or bearer token is valid and not expired.",
        ),
        Error::Api(err) if err.is_forbidden() => error_obj(
            ErrorCode::Forbidden,
            &err.message,
            "The credential lacks access to this resource or space.",
        ),
        Error::Api(err) if err.is_not_found() => error_obj(
            ErrorCode::NotFound,
            &err.message,
            "Check the id; the corresponding list operation shows valid ids.",
        ),
        Error::Api(err) if err.is_server_error() => error_obj(
            ErrorCode::UpstreamError,
            &err.message,
            "The upstream API failed; retry later.",
        ),
        Error::Api(err) => error_obj(
            ErrorCode::ApiError,
            &err.message,
            "The upstream API rejected the request; check the arguments.",
        ),
        Error::Timeout { endpoint, elapsed_ms } => error_obj(
            ErrorCode::Timeout,
            format!("request to {endpoint} timed out after {elapsed_ms}ms"),
            "Retry; if this persists, check upstream availability.",
        ),
        Error::Transport(m) => error_obj(
            ErrorCode::NetworkError,
            m,
            "Check network connectivity to the upstream API.",
        ),
    }
}
