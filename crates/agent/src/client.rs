use anyhow::{Context, Result};
use meridian_core::cluster::{NODE_ID_HEADER, NODE_SECRET_HEADER};
use meridian_core::{EntityKind, ListAfterVersionResponse, TaskAck};
use reqwest::Url;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;

/// HTTP client authenticated as one node.
#[derive(Clone)]
pub struct SyncClient {
    http: reqwest::Client,
    base_url: Url,
    unique_id: String,
    secret: String,
}

impl SyncClient {
    pub fn new(base_url: &str, unique_id: &str, secret: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid server URL")?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            unique_id: unique_id.to_string(),
            secret: secret.to_string(),
        })
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).context("failed to build API URL")
    }

    async fn send_json<T: DeserializeOwned>(&self, req: reqwest::RequestBuilder) -> Result<T> {
        let response = req
            .header(NODE_ID_HEADER, &self.unique_id)
            .header(NODE_SECRET_HEADER, &self.secret)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("API error ({}): {}", status, body);
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Rows of `kind` changed after `version`, oldest first.
    pub async fn pull(
        &self,
        kind: EntityKind,
        version: i64,
        limit: u32,
    ) -> Result<ListAfterVersionResponse> {
        let mut url = self.url(&format!("/v1/sync/{}", kind.as_str()))?;
        url.query_pairs_mut()
            .append_pair("version", &version.to_string())
            .append_pair("limit", &limit.to_string());
        self.send_json(self.http.get(url)).await
    }

    pub async fn heartbeat(&self, status: Option<serde_json::Value>) -> Result<HeartbeatResponse> {
        let url = self.url("/v1/node/heartbeat")?;
        let req = HeartbeatRequest { status };
        self.send_json(self.http.post(url).json(&req)).await
    }

    pub async fn node_tasks(&self) -> Result<Vec<NodeTask>> {
        let url = self.url("/v1/node/tasks")?;
        self.send_json(self.http.get(url)).await
    }

    /// Delete handled tasks at the versions listed. Returns how many the
    /// server removed; tasks refreshed in the meantime stay pending.
    pub async fn ack_tasks(&self, tasks: &[TaskAck]) -> Result<u64> {
        let url = self.url("/v1/node/tasks/ack")?;
        let req = AckTasksRequest { tasks };
        let response: AckTasksResponse = self.send_json(self.http.post(url).json(&req)).await?;
        Ok(response.deleted)
    }
}

// =============================================================================
// Request/response types (mirrored from server handlers)
// =============================================================================

#[derive(Debug, Serialize)]
struct HeartbeatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatResponse {
    pub node_id: i64,
    pub reactivated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeTask {
    pub id: i64,
    pub kind: String,
    pub version: i64,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
struct AckTasksRequest<'a> {
    tasks: &'a [TaskAck],
}

#[derive(Debug, Deserialize)]
struct AckTasksResponse {
    deleted: u64,
}
