//! Classification of non-2xx upstream responses into [`ApiError`] values.
//!
//! The upstream API answers failures with one of two JSON body shapes:
//! a flat `{statusCode, statusDescription, message, severity}` object, or an
//! RFC-7807 problem document `{type, title, status, detail, instance}`.
//! Both are accepted; classification tries an ordered list of parse
//! strategies and falls back to the raw body, then to the status line.

use crate::ApiError;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Bound on how much of an unstructured body ends up in messages/logs.
/// Upstream error pages can be large HTML documents.
const MAX_RAW_BODY_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProblemBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

fn nonempty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn flat_message(body: &serde_json::Value) -> Option<String> {
    let flat: FlatErrorBody = serde_json::from_value(body.clone()).ok()?;
    nonempty(flat.message)
}

fn problem_message(body: &serde_json::Value) -> Option<String> {
    let problem: ProblemBody = serde_json::from_value(body.clone()).ok()?;
    let title = nonempty(problem.title);
    let detail = nonempty(problem.detail);
    match (title, detail) {
        (Some(t), Some(d)) => Some(format!("{t}: {d}")),
        (Some(t), None) => Some(t),
        (None, Some(d)) => Some(d),
        (None, None) => None,
    }
}

fn status_description(body: &serde_json::Value) -> Option<String> {
    let flat: FlatErrorBody = serde_json::from_value(body.clone()).ok()?;
    nonempty(flat.status_description)
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

/// Classify a non-2xx response into an [`ApiError`].
///
/// `status_text` is the reason phrase for the status code (e.g.
/// "Internal Server Error"); `body` is the raw response text.
pub fn classify(status: u16, status_text: &str, endpoint: &str, body: &str) -> ApiError {
    let message = derive_message(status, status_text, body);
    ApiError {
        status,
        status_text: status_text.to_string(),
        message,
        endpoint: endpoint.to_string(),
    }
}

fn derive_message(status: u16, status_text: &str, body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(parsed) => {
            let strategies = [flat_message, problem_message, status_description];
            for strategy in strategies {
                if let Some(message) = strategy(&parsed) {
                    return message;
                }
            }
            format!("API Error {status}: {status_text}")
        }
        Err(_) => {
            let raw = body.trim();
            if raw.is_empty() {
                format!("API Error {status}: {status_text}")
            } else {
                truncate_chars(raw, MAX_RAW_BODY_CHARS)
            }
        }
    }
}

/// Parse a `Retry-After` header value: a non-negative integer number of
/// seconds, or an HTTP date converted to whole seconds remaining from `now`
/// (clamped at zero for dates already past). Anything else is absent, not
/// zero.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<i64>() {
        return u64::try_from(secs).ok();
    }
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let remaining = date.with_timezone(&Utc).signed_duration_since(now).num_seconds();
        return Some(remaining.max(0) as u64);
    }
    None
}
