//! Run analytics queries.

use crate::{ApiClient, RequestSpec};
use webharvest_core::Result;

#[derive(Debug, Clone, Default)]
pub struct RunAnalyticsQuery {
    pub agent_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page_index: Option<u32>,
    pub records_per_page: Option<u32>,
}

impl RunAnalyticsQuery {
    fn to_query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if let Some(v) = &self.agent_id {
            q.push(("agentId", v.clone()));
        }
        if let Some(v) = &self.from {
            q.push(("from", v.clone()));
        }
        if let Some(v) = &self.to {
            q.push(("to", v.clone()));
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

impl ApiClient {
    pub async fn run_analytics(&self, query: &RunAnalyticsQuery) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get("analytics/runs").query(query.to_query()))
            .await
    }
}
