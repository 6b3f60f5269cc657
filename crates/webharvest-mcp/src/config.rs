//! Process configuration from the environment.
//!
//! Empty values are treated as unset so `WEBHARVEST_API_KEY=""` does not
//! masquerade as a configured credential.

use url::Url;

pub(crate) const DEFAULT_API_BASE_URL: &str = "https://cloud.webharvest.io/api";
pub(crate) const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
pub(crate) const DEFAULT_HTTP_PORT: u16 = 3000;
pub(crate) const DEFAULT_MAX_SESSIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub api_base_url: Url,
    pub api_key: Option<String>,
    pub debug: bool,
    pub transport: Transport,
    pub http_host: String,
    pub http_port: u16,
    /// Canonical URL override when this server sits behind a proxy or a
    /// public hostname.
    pub public_url: Option<String>,
    /// External authorization server advertised by the discovery documents.
    pub oauth_issuer: Option<String>,
    /// Fallback OAuth client id for clients without dynamic registration.
    pub oauth_client_id: Option<String>,
    /// Skip the bearer challenge entirely (local testing).
    pub allow_anonymous: bool,
    pub max_sessions: usize,
    /// Honor X-Forwarded-Proto/Host when deriving the canonical URL.
    pub trust_proxy: bool,
}

pub(crate) fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_truthy(key: &str) -> bool {
    matches!(
        std::env::var(key)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let raw_base =
            env_nonempty("WEBHARVEST_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.into());
        let api_base_url = Url::parse(&raw_base)
            .map_err(|e| anyhow::anyhow!("invalid WEBHARVEST_API_BASE_URL {raw_base:?}: {e}"))?;

        let transport = match env_nonempty("WEBHARVEST_TRANSPORT").as_deref() {
            Some("http") | Some("streamable-http") => Transport::Http,
            _ => Transport::Stdio,
        };

        let http_port = env_nonempty("WEBHARVEST_HTTP_PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);
        let max_sessions = env_nonempty("WEBHARVEST_MAX_SESSIONS")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_MAX_SESSIONS)
            .max(1);

        Ok(Self {
            api_base_url,
            api_key: env_nonempty("WEBHARVEST_API_KEY"),
            debug: env_truthy("WEBHARVEST_DEBUG"),
            transport,
            http_host: env_nonempty("WEBHARVEST_HTTP_HOST")
                .unwrap_or_else(|| DEFAULT_HTTP_HOST.into()),
            http_port,
            public_url: env_nonempty("WEBHARVEST_PUBLIC_URL"),
            oauth_issuer: env_nonempty("WEBHARVEST_OAUTH_ISSUER"),
            oauth_client_id: env_nonempty("WEBHARVEST_OAUTH_CLIENT_ID"),
            allow_anonymous: env_truthy("WEBHARVEST_ALLOW_ANONYMOUS"),
            max_sessions,
            trust_proxy: env_truthy("WEBHARVEST_TRUST_PROXY"),
        })
    }

    /// Issuer advertised in discovery documents; defaults to the upstream
    /// API origin when not configured explicitly.
    pub(crate) fn issuer(&self) -> String {
        if let Some(issuer) = &self.oauth_issuer {
            return issuer.trim_end_matches('/').to_string();
        }
        let origin = self.api_base_url.origin().ascii_serialization();
        origin.trim_end_matches('/').to_string()
    }
}
