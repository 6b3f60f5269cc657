//! Credential resolution for upstream requests.
//!
//! A [`CredentialStore`] holds an optional static API key (fixed at
//! construction) and a mutable bearer-token slot. The bearer slot can be
//! replaced in place mid-connection, so a token refresh is honored on the
//! next attempt without rebuilding the client.

use std::sync::RwLock;
use webharvest_core::{Error, Result};

#[derive(Debug, Default)]
pub struct CredentialStore {
    api_key: Option<String>,
    bearer: RwLock<Option<String>>,
}

fn nonempty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl CredentialStore {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: nonempty(api_key),
            bearer: RwLock::new(None),
        }
    }

    pub fn with_bearer(api_key: Option<String>, bearer: Option<String>) -> Self {
        Self {
            api_key: nonempty(api_key),
            bearer: RwLock::new(nonempty(bearer)),
        }
    }

    /// Replace the bearer token in place (token refresh). `None` clears it.
    pub fn set_bearer_token(&self, token: Option<String>) {
        let mut slot = self.bearer.write().unwrap_or_else(|e| e.into_inner());
        *slot = nonempty(token);
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.bearer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn has_any_credential(&self) -> bool {
        self.has_api_key() || self.bearer_token().is_some()
    }

    /// Resolve the `Authorization` header value for one attempt.
    ///
    /// Prefers the bearer token, falls back to the static API key, and fails
    /// closed when neither is configured. Called once per attempt so a
    /// credential swap between attempts is picked up.
    pub fn authorization_header(&self) -> Result<String> {
        if let Some(token) = self.bearer_token() {
            return Ok(format!("Bearer {token}"));
        }
        if let Some(key) = &self.api_key {
            return Ok(format!("ApiKey {key}"));
        }
        Err(Error::Authentication(
            "no bearer token presented and no static API key configured".to_string(),
        ))
    }
}
