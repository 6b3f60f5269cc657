//! Space (team workspace) lookups.

use crate::{ApiClient, RequestSpec};
use webharvest_core::Result;

impl ApiClient {
    pub async fn list_spaces(&self) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get("space/all")).await
    }

    pub async fn get_space(&self, space_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get(format!("space/{space_id}")))
            .await
    }
}
