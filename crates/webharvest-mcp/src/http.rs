//! Streamable HTTP transport: per-connection sessions addressed by the
//! `Mcp-Session-Id` header, bearer challenge + OAuth discovery documents,
//! and the shutdown drain.
//!
//! POST carries JSON-RPC frames; requests are answered as plain JSON,
//! notifications with 202. GET (server-initiated streams) is not offered on
//! this transport and answers 405.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::config::Config;
use crate::envelope::{error_obj, ErrorCode};
use crate::server::HarvestMcp;
use crate::session::{
    spawn_reaper, MonotonicClock, Session, SessionError, SessionStore, REAP_INTERVAL,
    SESSION_IDLE_TIMEOUT, SHUTDOWN_CEILING,
};
use webharvest_client::{ApiClient, CredentialStore};

pub(crate) const MCP_SESSION_HEADER: &str = "mcp-session-id";

/// Deadline on the initialize round-trip through a fresh server instance.
const INITIALIZE_DEADLINE: Duration = Duration::from_secs(10);
/// Deadline on any later request; generous because a tool call may spend the
/// upstream executor's full retry budget.
const REQUEST_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub(crate) struct AppState {
    config: Arc<Config>,
    store: Arc<SessionStore>,
    http: reqwest::Client,
}

fn jsonrpc_error(
    status: StatusCode,
    code: i64,
    message: &str,
    data: Option<serde_json::Value>,
) -> Response {
    let mut error = serde_json::json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    (
        status,
        Json(serde_json::json!({ "jsonrpc": "2.0", "id": null, "error": error })),
    )
        .into_response()
}

fn capacity_response() -> Response {
    jsonrpc_error(
        StatusCode::SERVICE_UNAVAILABLE,
        -32000,
        "session capacity reached; retry shortly",
        Some(error_obj(
            ErrorCode::Capacity,
            "session capacity reached",
            "Retry shortly, or terminate idle sessions first.",
        )),
    )
}

fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// The URL this server is reachable at, for discovery documents and the
/// bearer challenge. Forwarded headers are honored only behind a trusted
/// proxy.
fn canonical_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(public) = &config.public_url {
        return public.trim_end_matches('/').to_string();
    }
    if config.trust_proxy {
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok());
        let host = headers
            .get("x-forwarded-host")
            .or_else(|| headers.get(header::HOST))
            .and_then(|v| v.to_str().ok());
        if let (Some(proto), Some(host)) = (proto, host) {
            return format!("{proto}://{host}");
        }
    }
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        return format!("http://{host}");
    }
    format!("http://{}:{}", config.http_host, config.http_port)
}

fn challenge_response(config: &Config, headers: &HeaderMap) -> Response {
    let metadata_url = format!(
        "{}/.well-known/oauth-protected-resource",
        canonical_url(config, headers)
    );
    let mut response = jsonrpc_error(
        StatusCode::UNAUTHORIZED,
        -32001,
        "authentication required",
        Some(serde_json::json!({ "resource_metadata": metadata_url })),
    );
    if let Ok(value) = HeaderValue::from_str(&format!(
        "Bearer resource_metadata=\"{metadata_url}\""
    )) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let msg: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => {
            return jsonrpc_error(
                StatusCode::BAD_REQUEST,
                -32700,
                "request body is not valid JSON",
                None,
            )
        }
    };
    let bearer = bearer_from_headers(&headers);
    let session_id = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match session_id {
        None => {
            // New connection. Challenge before anything is constructed when
            // policy requires a credential and none was presented.
            if bearer.is_none() && state.config.api_key.is_none() && !state.config.allow_anonymous {
                return challenge_response(&state.config, &headers);
            }
            create_session(state, bearer, msg).await
        }
        Some(id) => {
            let Some(session) = state.store.get(&id) else {
                return jsonrpc_error(
                    StatusCode::NOT_FOUND,
                    -32600,
                    "unknown or expired session",
                    None,
                );
            };
            // Credential refresh mid-connection, without reconnecting.
            if let Some(token) = bearer {
                session.credentials().set_bearer_token(Some(token));
            }
            dispatch(&session, msg).await
        }
    }
}

async fn create_session(
    state: AppState,
    bearer: Option<String>,
    msg: serde_json::Value,
) -> Response {
    if msg.get("method").and_then(|m| m.as_str()) != Some("initialize") {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            -32600,
            "a new connection must start with an initialize request",
            None,
        );
    }
    if !state.store.has_capacity() {
        return capacity_response();
    }

    let credentials = Arc::new(CredentialStore::with_bearer(
        state.config.api_key.clone(),
        bearer,
    ));
    let api = Arc::new(ApiClient::new(
        state.http.clone(),
        state.config.api_base_url.clone(),
        credentials.clone(),
    ));
    let handler = HarvestMcp::new(state.config.clone(), api);
    let id = uuid::Uuid::new_v4().to_string();
    let session = Session::open(id.clone(), handler, credentials, state.store.now_ms());

    let reply = match session.request(msg, INITIALIZE_DEADLINE).await {
        Ok(reply) => reply,
        Err(e) => {
            // The transport produced no identifier: close the fresh server
            // instance and never register it.
            session.close().await;
            tracing::error!(error = %e, "session initialize failed");
            let message = if state.config.debug {
                format!("initialize failed: {e}")
            } else {
                "failed to establish session".to_string()
            };
            return jsonrpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                -32603,
                &message,
                Some(error_obj(
                    ErrorCode::UnexpectedError,
                    &message,
                    "Retry; check server logs for details.",
                )),
            );
        }
    };
    if reply.get("error").is_some() {
        session.close().await;
        return (StatusCode::OK, Json(reply)).into_response();
    }

    match state.store.register(session) {
        Ok(()) => {
            tracing::info!(session_id = %id, "session established");
            let mut response = (StatusCode::OK, Json(reply)).into_response();
            if let Ok(value) = HeaderValue::from_str(&id) {
                response
                    .headers_mut()
                    .insert(header::HeaderName::from_static(MCP_SESSION_HEADER), value);
            }
            response
        }
        Err(rejected) => {
            // An interleaved creation filled the store between the pre-check
            // and registration.
            rejected.close().await;
            capacity_response()
        }
    }
}

async fn dispatch(session: &Session, msg: serde_json::Value) -> Response {
    let is_request = msg.get("id").is_some() && msg.get("method").is_some();
    if is_request {
        match session.request(msg, REQUEST_DEADLINE).await {
            Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
            Err(SessionError::Deadline) => jsonrpc_error(
                StatusCode::GATEWAY_TIMEOUT,
                -32603,
                "no response before the deadline",
                None,
            ),
            Err(SessionError::DuplicateRequestId) => jsonrpc_error(
                StatusCode::BAD_REQUEST,
                -32600,
                "a request with this id is already in flight",
                None,
            ),
            Err(_) => jsonrpc_error(
                StatusCode::NOT_FOUND,
                -32600,
                "session is no longer available",
                None,
            ),
        }
    } else {
        // Notification, or the client's reply to a server-initiated request.
        match session.notify(&msg).await {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => jsonrpc_error(
                StatusCode::NOT_FOUND,
                -32600,
                "session is no longer available",
                None,
            ),
        }
    }
}

async fn handle_delete(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(id) = headers
        .get(MCP_SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return jsonrpc_error(
            StatusCode::BAD_REQUEST,
            -32600,
            "missing session header",
            None,
        );
    };
    // Removal precedes close so no concurrent request routes to a session
    // mid-teardown.
    match state.store.remove(id) {
        Some(session) => {
            session.close().await;
            tracing::info!(session_id = %id, "session terminated by client");
            StatusCode::NO_CONTENT.into_response()
        }
        None => jsonrpc_error(
            StatusCode::NOT_FOUND,
            -32600,
            "unknown or expired session",
            None,
        ),
    }
}

async fn handle_get() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST, DELETE")],
        "this transport does not offer server-initiated streams",
    )
        .into_response()
}

async fn authorization_server_metadata(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let issuer = state.config.issuer();
    let mut doc = serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/oauth/authorize"),
        "token_endpoint": format!("{issuer}/oauth/token"),
        "scopes_supported": ["openid", "profile", "email"],
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token"],
        "code_challenge_methods_supported": ["S256"],
    });
    if let Some(client_id) = &state.config.oauth_client_id {
        // Fallback for clients without dynamic registration.
        doc["client_id"] = serde_json::json!(client_id);
    }
    Json(doc)
}

async fn protected_resource_metadata(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<serde_json::Value> {
    let resource = canonical_url(&state.config, &headers);
    Json(serde_json::json!({
        "resource": resource,
        "authorization_servers": [state.config.issuer()],
        "bearer_methods_supported": ["header"],
        "scopes_supported": ["openid", "profile", "email"],
    }))
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/mcp",
            axum::routing::post(handle_post)
                .delete(handle_delete)
                .get(handle_get),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c; shutting down"),
        _ = terminate => tracing::info!("received terminate signal; shutting down"),
    }
}

/// Close every live session concurrently, bounded by the hard ceiling so a
/// hung close cannot block process exit.
pub(crate) async fn drain_store(store: &SessionStore) {
    let sessions = store.drain();
    if sessions.is_empty() {
        return;
    }
    tracing::info!(count = sessions.len(), "closing sessions for shutdown");
    let closes = sessions.iter().map(|s| s.close());
    if tokio::time::timeout(SHUTDOWN_CEILING, futures::future::join_all(closes))
        .await
        .is_err()
    {
        tracing::warn!("shutdown drain exceeded the hard ceiling; exiting anyway");
    }
}

pub(crate) async fn serve_http(config: Arc<Config>) -> anyhow::Result<()> {
    let http = reqwest::Client::builder()
        .user_agent(concat!("webharvest/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let clock = Arc::new(MonotonicClock::new());
    let store = Arc::new(SessionStore::new(config.max_sessions, clock));
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        http,
    };

    let listener =
        tokio::net::TcpListener::bind((config.http_host.as_str(), config.http_port)).await?;
    tracing::info!(addr = %listener.local_addr()?, "streamable http transport listening");

    let reaper = spawn_reaper(store.clone(), REAP_INTERVAL, SESSION_IDLE_TIMEOUT);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // New connections are no longer accepted; stop the sweep and drain.
    reaper.abort();
    drain_store(&store).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;
    use url::Url;

    fn test_config() -> Config {
        Config {
            api_base_url: Url::parse("http://127.0.0.1:9").expect("url"),
            api_key: None,
            debug: false,
            transport: Transport::Http,
            http_host: "127.0.0.1".into(),
            http_port: 0,
            public_url: None,
            oauth_issuer: Some("https://auth.example.com".into()),
            oauth_client_id: Some("webharvest-default".into()),
            allow_anonymous: true,
            max_sessions: 8,
            trust_proxy: false,
        }
    }

    async fn spawn_app(config: Config) -> (String, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::new(
            config.max_sessions,
            Arc::new(MonotonicClock::new()),
        ));
        let state = AppState {
            config: Arc::new(config),
            store: store.clone(),
            http: reqwest::Client::new(),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.expect("serve");
        });
        (format!("http://{addr}"), store)
    }

    fn initialize_body() -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "clientInfo": { "name": "http-test", "version": "0.0.0" }
            }
        })
    }

    async fn establish(client: &reqwest::Client, base: &str) -> String {
        let resp = client
            .post(format!("{base}/mcp"))
            .json(&initialize_body())
            .send()
            .await
            .expect("initialize");
        assert_eq!(resp.status(), 200);
        let id = resp
            .headers()
            .get(MCP_SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .expect("session header")
            .to_string();
        let body: serde_json::Value = resp.json().await.expect("json");
        assert!(body.get("result").is_some(), "got {body}");
        id
    }

    #[tokio::test]
    async fn initialize_assigns_a_session_and_reuse_routes_to_it() {
        let (base, store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();

        let id = establish(&client, &base).await;
        assert_eq!(store.len(), 1);

        // Handshake completion is a notification: accepted, no body.
        let resp = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_HEADER, &id)
            .json(&serde_json::json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
            .send()
            .await
            .expect("notify");
        assert_eq!(resp.status(), 202);

        let resp = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_HEADER, &id)
            .json(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}))
            .send()
            .await
            .expect("tools/list");
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.expect("json");
        assert!(body["result"]["tools"].as_array().is_some(), "got {body}");

        // Still exactly one session; the identifier routed to the same one.
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn each_initialize_creates_a_distinct_session() {
        let (base, store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();
        let a = establish(&client, &base).await;
        let b = establish(&client, &base).await;
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn missing_credentials_yield_a_structured_challenge() {
        let config = Config {
            allow_anonymous: false,
            api_key: None,
            ..test_config()
        };
        let (base, store) = spawn_app(config).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/mcp"))
            .json(&initialize_body())
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), 401);
        let challenge = resp
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .expect("challenge header")
            .to_string();
        assert!(challenge.contains("resource_metadata="), "{challenge}");
        let body: serde_json::Value = resp.json().await.expect("json");
        let metadata = body["error"]["data"]["resource_metadata"]
            .as_str()
            .expect("metadata url");
        assert!(metadata.ends_with("/.well-known/oauth-protected-resource"));
        // A challenged request never enters pending-create.
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn bearer_presented_on_a_later_request_replaces_the_credential() {
        let (base, store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();

        let id = establish(&client, &base).await;
        let session = store.get(&id).expect("session");
        assert_eq!(session.credentials().bearer_token(), None);

        let resp = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_HEADER, &id)
            .header("authorization", "Bearer fresh-token")
            .json(&serde_json::json!({"jsonrpc":"2.0","method":"notifications/initialized"}))
            .send()
            .await
            .expect("notify");
        assert_eq!(resp.status(), 202);
        assert_eq!(
            session.credentials().bearer_token().as_deref(),
            Some("fresh-token")
        );
    }

    #[tokio::test]
    async fn delete_terminates_the_session() {
        let (base, store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();
        let id = establish(&client, &base).await;

        let resp = client
            .delete(format!("{base}/mcp"))
            .header(MCP_SESSION_HEADER, &id)
            .send()
            .await
            .expect("delete");
        assert_eq!(resp.status(), 204);
        assert_eq!(store.len(), 0);

        let resp = client
            .post(format!("{base}/mcp"))
            .header(MCP_SESSION_HEADER, &id)
            .json(&serde_json::json!({"jsonrpc":"2.0","id":2,"method":"tools/list"}))
            .send()
            .await
            .expect("post after delete");
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn capacity_overflow_is_a_retryable_error() {
        let config = Config {
            max_sessions: 1,
            ..test_config()
        };
        let (base, store) = spawn_app(config).await;
        let client = reqwest::Client::new();

        establish(&client, &base).await;
        assert_eq!(store.len(), 1);

        let resp = client
            .post(format!("{base}/mcp"))
            .json(&initialize_body())
            .send()
            .await
            .expect("second initialize");
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.expect("json");
        assert_eq!(body["error"]["data"]["retryable"], true);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn get_is_method_not_allowed() {
        let (base, _store) = spawn_app(test_config()).await;
        let resp = reqwest::Client::new()
            .get(format!("{base}/mcp"))
            .send()
            .await
            .expect("get");
        assert_eq!(resp.status(), 405);
    }

    #[tokio::test]
    async fn non_initialize_without_a_session_is_rejected() {
        let (base, store) = spawn_app(test_config()).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/mcp"))
            .json(&serde_json::json!({"jsonrpc":"2.0","id":1,"method":"tools/list"}))
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status(), 400);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn discovery_documents_describe_the_authorization_flow() {
        let (base, _store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();

        let auth: serde_json::Value = client
            .get(format!("{base}/.well-known/oauth-authorization-server"))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(auth["issuer"], "https://auth.example.com");
        assert_eq!(
            auth["token_endpoint"],
            "https://auth.example.com/oauth/token"
        );
        assert_eq!(auth["code_challenge_methods_supported"][0], "S256");
        assert_eq!(auth["client_id"], "webharvest-default");

        let resource: serde_json::Value = client
            .get(format!("{base}/.well-known/oauth-protected-resource"))
            .send()
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(
            resource["authorization_servers"][0],
            "https://auth.example.com"
        );
        assert!(resource["resource"].as_str().is_some());
    }

    #[tokio::test]
    async fn shutdown_drain_closes_every_session_within_the_ceiling() {
        let (base, store) = spawn_app(test_config()).await;
        let client = reqwest::Client::new();
        let mut sessions = Vec::new();
        for _ in 0..3 {
            let id = establish(&client, &base).await;
            sessions.push(store.get(&id).expect("session"));
        }
        assert_eq!(store.len(), 3);

        let started = std::time::Instant::now();
        drain_store(&store).await;
        assert!(started.elapsed() <= SHUTDOWN_CEILING);
        assert_eq!(store.len(), 0);
        for s in &sessions {
            assert!(s.is_closed());
        }
    }
}
