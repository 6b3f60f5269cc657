//! Billing/usage reporting.

use crate::{ApiClient, RequestSpec};
use webharvest_core::Result;

impl ApiClient {
    /// Usage summary for an optional `from`/`to` window (upstream date
    /// strings are forwarded verbatim).
    pub async fn billing_usage(
        &self,
        from: Option<&str>,
        to: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut query = Vec::new();
        if let Some(v) = from {
            query.push(("from", v.to_string()));
        }
        if let Some(v) = to {
            query.push(("to", v.to_string()));
        }
        self.execute(RequestSpec::get("billing/usage").query(query))
            .await
    }
}
