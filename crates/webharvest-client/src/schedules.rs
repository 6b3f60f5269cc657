//! Schedule operations. Create is a POST (single attempt); update and delete
//! are idempotent and retried like any other idempotent request.

use crate::{ApiClient, RequestSpec};
use webharvest_core::Result;

impl ApiClient {
    pub async fn list_schedules(&self, space_id: Option<&str>) -> Result<serde_json::Value> {
        let mut query = Vec::new();
        if let Some(v) = space_id {
            query.push(("spaceId", v.to_string()));
        }
        self.execute(RequestSpec::get("schedule/all").query(query))
            .await
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::get(format!("schedule/{schedule_id}")))
            .await
    }

    /// Create a schedule. The definition is upstream-defined JSON and is
    /// forwarded as-is.
    pub async fn create_schedule(&self, definition: serde_json::Value) -> Result<serde_json::Value> {
        self.execute(RequestSpec::post("schedule").body(definition))
            .await
    }

    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        definition: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.execute(RequestSpec::put(format!("schedule/{schedule_id}")).body(definition))
            .await
    }

    pub async fn delete_schedule(&self, schedule_id: &str) -> Result<serde_json::Value> {
        self.execute(RequestSpec::delete(format!("schedule/{schedule_id}")))
            .await
    }
}
