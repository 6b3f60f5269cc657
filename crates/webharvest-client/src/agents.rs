//! Agent operations: list, inspect, start, and control runs.
//!
//! Responses are passed through as JSON; the tool layer owns presentation.
//! Listing and inspection are idempotent GETs; start/stop/kill are POSTs and
//! therefore never retried by the executor.

use crate::{ApiClient, RequestSpec};
use serde::Serialize;
use webharvest_core::Result;

/// Filters and paging for [`ApiClient::list_agents`].
#[derive(Debug, Clone, Default)]
pub struct AgentListQuery {
    pub status: Option<String>,
    pub space_id: Option<String>,
    pub name: Option<String>,
    pub config_type: Option<String>,
    pub sort_column: Option<String>,
    pub sort_order: Option<String>,
    pub page_index: Option<u32>,
    pub records_per_page: Option<u32>,
}

impl AgentListQuery {
    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if let Some(v) = &self.status {
            q.push(("status", v.clone()));
        }
        if let Some(v) = &self.space_id {
            q.push(("spaceId", v.clone()));
        }
        if let Some(v) = &self.name {
            q.push(("name", v.clone()));
        }
        if let Some(v) = &self.config_type {
            q.push(("configType", v.clone()));
        }
        if let Some(v) = &self.sort_column {
            q.push(("sortColumn", v.clone()));
        }
        if let Some(v) = &self.sort_order {
            q.push(("sortOrder", v.clone()));
        }
        if let Some(v) = self.page_index {
            q.push(("pageIndex", v.to_string()));
        }
        if let Some(v) = self.records_per_page {
            q.push(("recordsPerPage", v.to_string()));
        }
        q
    }
}

/// Run options for `POST /agent/{id}/start`. Field names follow the upstream
/// wire contract.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartAgentOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_max_concurrency: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_export: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_pool_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_parameters: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_exclusive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_wait_on_failure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_run_synchronously: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_mode: Option<String>,
}

impl ApiClient {
    pub async fn list_agents(&self, query: &AgentListQuery) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get("agent/all").query(query.to_query()))
            .await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get(format!("agent/{agent_id}")))
            .await
    }

    /// Start an agent run. Never retried: a duplicate start is a duplicate
    /// scrape job.
    pub async fn start_agent(
        &self,
        agent_id: &str,
        options: &StartAgentOptions,
    ) -> Result<serde_json::Value> {
        let body = serde_json::to_value(options)
            .unwrap_or_else(|_| serde_json::json!({}));
        self.execute(RequestSpec::post(format!("agent/{agent_id}/start")).body(body))
            .await
    }

    /// Request a graceful stop of a running job.
    pub async fn stop_run(&self, agent_id: &str, run_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::post(format!("agent/{agent_id}/run/{run_id}/stop")))
            .await
    }

    /// Hard-kill a running job.
    pub async fn kill_run(&self, agent_id: &str, run_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::post(format!("agent/{agent_id}/run/{run_id}/kill")))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CredentialStore;
    use axum::extract::{Path, Query, RawQuery};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use url::Url;

    async fn spawn_fixture(app: Router) -> ApiClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fixture");
        let addr = listener.local_addr().expect("local_addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("axum serve");
        });
        ApiClient::new(
            reqwest::Client::new(),
            Url::parse(&format!("http://{addr}")).expect("fixture url"),
            Arc::new(CredentialStore::new(Some("k".into()))),
        )
    }

    #[tokio::test]
    async fn list_agents_sends_upstream_query_names() {
        let app = Router::new().route(
            "/agent/all",
            get(|Query(params): Query<BTreeMap<String, String>>| async move {
                Json(serde_json::json!({ "query": params }))
            }),
        );
        let client = spawn_fixture(app).await;

        let out = client
            .list_agents(&AgentListQuery {
                status: Some("Running".into()),
                space_id: Some("s-1".into()),
                page_index: Some(2),
                records_per_page: Some(50),
                ..AgentListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(out["query"]["status"], "Running");
        assert_eq!(out["query"]["spaceId"], "s-1");
        assert_eq!(out["query"]["pageIndex"], "2");
        assert_eq!(out["query"]["recordsPerPage"], "50");
    }

    #[tokio::test]
    async fn empty_query_sends_no_parameters() {
        let app = Router::new().route(
            "/agent/all",
            get(|RawQuery(raw): RawQuery| async move {
                Json(serde_json::json!({ "raw": raw }))
            }),
        );
        let client = spawn_fixture(app).await;

        let out = client.list_agents(&AgentListQuery::default()).await.unwrap();
        assert_eq!(out["raw"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn start_agent_posts_wire_shaped_body() {
        let app = Router::new().route(
            "/agent/42/start",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(serde_json::json!({ "received": body }))
            }),
        );
        let client = spawn_fixture(app).await;

        let out = client
            .start_agent(
                "42",
                &StartAgentOptions {
                    parallelism: Some(4),
                    proxy_pool_id: Some("pool-1".into()),
                    is_exclusive: Some(true),
                    input_parameters: Some(serde_json::json!({"seed": "https://example.com"})),
                    ..StartAgentOptions::default()
                },
            )
            .await
            .unwrap();
        let received = &out["received"];
        assert_eq!(received["Parallelism"], 4);
        assert_eq!(received["ProxyPoolId"], "pool-1");
        assert_eq!(received["IsExclusive"], true);
        assert_eq!(received["InputParameters"]["seed"], "https://example.com");
        // Unset options stay off the wire entirely.
        assert!(received.get("LogLevel").is_none());
    }

    #[tokio::test]
    async fn run_control_paths_include_both_ids() {
        let app = Router::new().route(
            "/agent/:agent_id/run/:run_id/stop",
            post(
                |Path((agent_id, run_id)): Path<(String, String)>| async move {
                    Json(serde_json::json!({ "agentId": agent_id, "runId": run_id }))
                },
            ),
        );
        let client = spawn_fixture(app).await;

        let out = client.stop_run("42", "r-7").await.unwrap();
        assert_eq!(out["agentId"], "42");
        assert_eq!(out["runId"], "r-7");
    }
}
