//! MCP tool surface over the control-plane client.
//!
//! Tools never fail at the protocol level for upstream problems: every
//! outcome is a structured payload with `ok` plus an error envelope, so a
//! misbehaving upstream cannot take the connection down with it.

use std::sync::Arc;
use std::time::Instant;

use rmcp::{
    handler::server::router::tool::ToolRouter as RmcpToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
    ErrorData as McpError, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::config::Config;
use crate::envelope::{add_envelope_fields, error_obj, upstream_error, ErrorCode};
use webharvest_client::agents::{AgentListQuery, StartAgentOptions};
use webharvest_client::analytics::RunAnalyticsQuery;
use webharvest_client::{ApiClient, CredentialStore};

pub(crate) fn tool_result(payload: serde_json::Value) -> CallToolResult {
    // Structured content for machine consumers, plus a text fallback for
    // clients that only read `content[0].text`.
    let mut r = CallToolResult::structured(payload.clone());
    r.content = vec![Content::text(payload.to_string())];
    r
}

fn fail(kind: &str, t0: Instant, error: serde_json::Value) -> CallToolResult {
    let mut payload = serde_json::json!({ "ok": false, "error": error });
    add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
    tool_result(payload)
}

fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, serde_json::Value> {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => Ok(v),
        None => Err(error_obj(
            ErrorCode::InvalidParams,
            format!("{name} must be non-empty"),
            format!("Provide {name}."),
        )),
    }
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct AgentListArgs {
    /// Filter by agent status (e.g. Running, Stopped).
    #[serde(default)]
    status: Option<String>,
    /// Restrict to one space id.
    #[serde(default)]
    space_id: Option<String>,
    /// Substring match on the agent name.
    #[serde(default)]
    name: Option<String>,
    /// Filter by configuration type.
    #[serde(default)]
    config_type: Option<String>,
    #[serde(default)]
    sort_column: Option<String>,
    /// "asc" or "desc".
    #[serde(default)]
    sort_order: Option<String>,
    #[serde(default)]
    page_index: Option<u32>,
    #[serde(default)]
    records_per_page: Option<u32>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct AgentGetArgs {
    /// Agent id (required).
    #[serde(default)]
    agent_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct AgentStartArgs {
    /// Agent id (required).
    #[serde(default)]
    agent_id: Option<String>,
    /// Number of parallel branches to run.
    #[serde(default)]
    parallelism: Option<u32>,
    /// Cap on concurrently executing branches.
    #[serde(default)]
    parallel_max_concurrency: Option<u32>,
    /// Export results from parallel branches as they finish.
    #[serde(default)]
    parallel_export: Option<bool>,
    /// Proxy pool to route the run through.
    #[serde(default)]
    proxy_pool_id: Option<String>,
    /// Input parameters forwarded to the agent (object).
    #[serde(default)]
    input_parameters: Option<serde_json::Value>,
    /// Run timeout in seconds.
    #[serde(default)]
    timeout: Option<u64>,
    /// Refuse to start while another run is active.
    #[serde(default)]
    is_exclusive: Option<bool>,
    #[serde(default)]
    is_wait_on_failure: Option<bool>,
    /// Block until the run completes instead of returning a run id.
    #[serde(default)]
    is_run_synchronously: Option<bool>,
    #[serde(default)]
    log_level: Option<String>,
    #[serde(default)]
    log_mode: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct RunControlArgs {
    /// Agent id (required).
    #[serde(default)]
    agent_id: Option<String>,
    /// Run id (required).
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct ScheduleListArgs {
    /// Restrict to one space id.
    #[serde(default)]
    space_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct ScheduleGetArgs {
    /// Schedule id (required).
    #[serde(default)]
    schedule_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct SpaceListArgs {}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct BillingUsageArgs {
    /// Start of the reporting window (upstream date string).
    #[serde(default)]
    from: Option<String>,
    /// End of the reporting window (upstream date string).
    #[serde(default)]
    to: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema, Default)]
struct RunAnalyticsArgs {
    /// Restrict to one agent id.
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    page_index: Option<u32>,
    #[serde(default)]
    records_per_page: Option<u32>,
}

#[derive(Clone)]
pub(crate) struct HarvestMcp {
    tool_router: RmcpToolRouter<Self>,
    config: Arc<Config>,
    api: Arc<ApiClient>,
}

#[tool_router]
impl HarvestMcp {
    pub(crate) fn new(config: Arc<Config>, api: Arc<ApiClient>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            api,
        }
    }

    async fn relay(
        &self,
        kind: &str,
        call: impl std::future::Future<Output = webharvest_core::Result<serde_json::Value>>,
        wrap: &str,
    ) -> CallToolResult {
        let t0 = Instant::now();
        let mut payload = match call.await {
            Ok(v) => {
                let mut obj = serde_json::Map::new();
                obj.insert("ok".to_string(), serde_json::Value::Bool(true));
                obj.insert(wrap.to_string(), v);
                serde_json::Value::Object(obj)
            }
            Err(e) => serde_json::json!({ "ok": false, "error": upstream_error(&e) }),
        };
        add_envelope_fields(&mut payload, kind, t0.elapsed().as_millis());
        tool_result(payload)
    }

    #[tool(description = "Report webharvest configuration + version (no secrets)")]
    async fn harvest_meta(&self) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        // Booleans and endpoints only, never credential values.
        let mut payload = serde_json::json!({
            "ok": true,
            "name": "webharvest",
            "version": env!("CARGO_PKG_VERSION"),
            "api_base_url": self.config.api_base_url.as_str(),
            "configured": {
                "api_key": self.config.api_key.is_some(),
                "bearer_token": self.api.credentials().bearer_token().is_some(),
                "oauth_client_id": self.config.oauth_client_id.is_some(),
            },
            "limits": {
                "max_sessions": self.config.max_sessions,
            },
            "supported": {
                "mcp_tools": [
                    "harvest_meta",
                    "agent_list",
                    "agent_get",
                    "agent_start",
                    "agent_stop",
                    "agent_kill",
                    "schedule_list",
                    "schedule_get",
                    "space_list",
                    "billing_usage",
                    "run_analytics",
                ],
            },
        });
        add_envelope_fields(&mut payload, "harvest_meta", t0.elapsed().as_millis());
        Ok(tool_result(payload))
    }

    #[tool(description = "List scraping agents with optional filters and paging")]
    async fn agent_list(
        &self,
        params: Parameters<Option<AgentListArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let query = AgentListQuery {
            status: args.status,
            space_id: args.space_id,
            name: args.name,
            config_type: args.config_type,
            sort_column: args.sort_column,
            sort_order: args.sort_order,
            page_index: args.page_index,
            records_per_page: args.records_per_page,
        };
        Ok(self
            .relay("agent_list", self.api.list_agents(&query), "agents")
            .await)
    }

    #[tool(description = "Fetch one agent's configuration and status")]
    async fn agent_get(
        &self,
        params: Parameters<Option<AgentGetArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        let args = params.0.unwrap_or_default();
        let agent_id = match require(&args.agent_id, "agent_id") {
            Ok(v) => v.to_string(),
            Err(e) => return Ok(fail("agent_get", t0, e)),
        };
        Ok(self
            .relay("agent_get", self.api.get_agent(&agent_id), "agent")
            .await)
    }

    #[tool(description = "Start an agent run (side effect; never retried automatically)")]
    async fn agent_start(
        &self,
        params: Parameters<Option<AgentStartArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        let args = params.0.unwrap_or_default();
        let agent_id = match require(&args.agent_id, "agent_id") {
            Ok(v) => v.to_string(),
            Err(e) => return Ok(fail("agent_start", t0, e)),
        };
        let options = StartAgentOptions {
            parallelism: args.parallelism,
            parallel_max_concurrency: args.parallel_max_concurrency,
            parallel_export: args.parallel_export,
            proxy_pool_id: args.proxy_pool_id,
            input_parameters: args.input_parameters,
            timeout: args.timeout,
            is_exclusive: args.is_exclusive,
            is_wait_on_failure: args.is_wait_on_failure,
            is_run_synchronously: args.is_run_synchronously,
            log_level: args.log_level,
            log_mode: args.log_mode,
        };
        Ok(self
            .relay(
                "agent_start",
                self.api.start_agent(&agent_id, &options),
                "run",
            )
            .await)
    }

    #[tool(description = "Gracefully stop a running agent job")]
    async fn agent_stop(
        &self,
        params: Parameters<Option<RunControlArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        let args = params.0.unwrap_or_default();
        let (agent_id, run_id) = match (
            require(&args.agent_id, "agent_id"),
            require(&args.run_id, "run_id"),
        ) {
            (Ok(a), Ok(r)) => (a.to_string(), r.to_string()),
            (Err(e), _) | (_, Err(e)) => return Ok(fail("agent_stop", t0, e)),
        };
        Ok(self
            .relay("agent_stop", self.api.stop_run(&agent_id, &run_id), "run")
            .await)
    }

    #[tool(description = "Hard-kill a running agent job")]
    async fn agent_kill(
        &self,
        params: Parameters<Option<RunControlArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        let args = params.0.unwrap_or_default();
        let (agent_id, run_id) = match (
            require(&args.agent_id, "agent_id"),
            require(&args.run_id, "run_id"),
        ) {
            (Ok(a), Ok(r)) => (a.to_string(), r.to_string()),
            (Err(e), _) | (_, Err(e)) => return Ok(fail("agent_kill", t0, e)),
        };
        Ok(self
            .relay("agent_kill", self.api.kill_run(&agent_id, &run_id), "run")
            .await)
    }

    #[tool(description = "List schedules, optionally restricted to one space")]
    async fn schedule_list(
        &self,
        params: Parameters<Option<ScheduleListArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(self
            .relay(
                "schedule_list",
                self.api.list_schedules(args.space_id.as_deref()),
                "schedules",
            )
            .await)
    }

    #[tool(description = "Fetch one schedule")]
    async fn schedule_get(
        &self,
        params: Parameters<Option<ScheduleGetArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let t0 = Instant::now();
        let args = params.0.unwrap_or_default();
        let schedule_id = match require(&args.schedule_id, "schedule_id") {
            Ok(v) => v.to_string(),
            Err(e) => return Ok(fail("schedule_get", t0, e)),
        };
        Ok(self
            .relay(
                "schedule_get",
                self.api.get_schedule(&schedule_id),
                "schedule",
            )
            .await)
    }

    #[tool(description = "List spaces visible to the credential")]
    async fn space_list(
        &self,
        _params: Parameters<Option<SpaceListArgs>>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self
            .relay("space_list", self.api.list_spaces(), "spaces")
            .await)
    }

    #[tool(description = "Report billing usage for an optional date window")]
    async fn billing_usage(
        &self,
        params: Parameters<Option<BillingUsageArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        Ok(self
            .relay(
                "billing_usage",
                self.api
                    .billing_usage(args.from.as_deref(), args.to.as_deref()),
                "usage",
            )
            .await)
    }

    #[tool(description = "Query run analytics (success/failure counts, volumes) with paging")]
    async fn run_analytics(
        &self,
        params: Parameters<Option<RunAnalyticsArgs>>,
    ) -> Result<CallToolResult, McpError> {
        let args = params.0.unwrap_or_default();
        let query = RunAnalyticsQuery {
            agent_id: args.agent_id,
            from: args.from,
            to: args.to,
            page_index: args.page_index,
            records_per_page: args.records_per_page,
        };
        Ok(self
            .relay("run_analytics", self.api.run_analytics(&query), "analytics")
            .await)
    }
}

#[tool_handler]
impl rmcp::ServerHandler for HarvestMcp {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Remote scraping control plane. Listing/inspection tools are safe to repeat; agent_start/stop/kill trigger side effects upstream."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// stdio transport: one implicit session for the process lifetime.
pub(crate) async fn serve_stdio(config: Arc<Config>) -> Result<(), McpError> {
    let credentials = Arc::new(CredentialStore::new(config.api_key.clone()));
    let http = reqwest::Client::builder()
        .user_agent(concat!("webharvest/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    let api = Arc::new(ApiClient::new(
        http,
        config.api_base_url.clone(),
        credentials,
    ));
    let svc = HarvestMcp::new(config, api);
    let running = svc
        .serve(stdio())
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    // Keep the stdio server alive until the client closes.
    running
        .waiting()
        .await
        .map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn test_handler() -> HarvestMcp {
        let config = Arc::new(Config {
            api_base_url: Url::parse("http://127.0.0.1:9").expect("url"),
            api_key: Some("k".into()),
            debug: false,
            transport: crate::config::Transport::Stdio,
            http_host: "127.0.0.1".into(),
            http_port: 0,
            public_url: None,
            oauth_issuer: None,
            oauth_client_id: None,
            allow_anonymous: true,
            max_sessions: 4,
            trust_proxy: false,
        });
        let api = Arc::new(
            ApiClient::new(
                reqwest::Client::new(),
                config.api_base_url.clone(),
                Arc::new(CredentialStore::new(config.api_key.clone())),
            )
            .with_retry_policy(webharvest_core::retry::RetryPolicy {
                max_retries: 1,
                base_delay_ms: 2,
                max_delay_ms: 10,
            }),
        );
        HarvestMcp::new(config, api)
    }

    fn payload_from_result(r: &CallToolResult) -> serde_json::Value {
        if let Some(v) = r.structured_content.clone() {
            return v;
        }
        let s = r
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap_or_default();
        serde_json::from_str(&s).unwrap_or_else(|_| serde_json::json!({}))
    }

    #[tokio::test]
    async fn harvest_meta_reports_configuration_without_secrets() {
        let svc = test_handler();
        let r = svc.harvest_meta().await.expect("meta");
        let v = payload_from_result(&r);
        assert_eq!(v["ok"], true);
        assert_eq!(v["kind"], "harvest_meta");
        assert_eq!(v["schema_version"], 1);
        assert_eq!(v["configured"]["api_key"], true);
        // The key itself must never appear.
        assert!(!v.to_string().contains("\"k\""));
    }

    #[tokio::test]
    async fn agent_get_requires_an_id() {
        let svc = test_handler();
        let r = svc
            .agent_get(Parameters(Some(AgentGetArgs::default())))
            .await
            .expect("call");
        let v = payload_from_result(&r);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "invalid_params");
        assert_eq!(v["error"]["retryable"], false);
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_network_error_envelope() {
        // Port 9 (discard) refuses connections; the error must surface as a
        // structured payload, not a protocol fault.
        let svc = test_handler();
        let r = svc
            .agent_list(Parameters(None))
            .await
            .expect("call never faults");
        let v = payload_from_result(&r);
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "network_error");
        assert_eq!(v["error"]["retryable"], true);
    }
}
