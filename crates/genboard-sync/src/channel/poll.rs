use super::decode_records;
use super::http::{build_client, check_status, ApiEndpoint};
use crate::config::SyncTimings;
use crate::error::SyncResult;
use crate::model::{deserialize_optional_status, Artifact, LogEntry, SessionStatus, Snapshot, SnapshotOrigin};
use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// On-demand snapshot source. One call is one request/response; failures come back as
/// values and never escape into the caller's loop.
#[async_trait]
pub trait PollChannel: Send + Sync {
    async fn fetch_snapshot(&self, session_id: &str) -> SyncResult<Snapshot>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionResponse {
    #[serde(default, deserialize_with = "deserialize_optional_status")]
    status: Option<SessionStatus>,
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "total_count")]
    total_count: Option<u64>,
}

impl CollectionResponse {
    fn items<T: DeserializeOwned>(&mut self, session_id: &str, kind: &'static str) -> Vec<T> {
        decode_records(self.data.take().unwrap_or_default(), session_id, kind)
    }
}

pub struct HttpPollChannel {
    client: reqwest::Client,
    endpoint: ApiEndpoint,
}

impl HttpPollChannel {
    pub fn new(endpoint: ApiEndpoint, timings: &SyncTimings) -> SyncResult<Self> {
        let client = build_client(timings.connect_timeout, Some(timings.request_timeout))?;
        Ok(Self { client, endpoint })
    }

    async fn get_collection(&self, collection: &str, session_id: &str) -> SyncResult<CollectionResponse> {
        let url = self.endpoint.resource(collection, session_id)?;
        let response = self
            .endpoint
            .authorize(self.client.get(url))
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json::<CollectionResponse>().await?)
    }
}

#[async_trait]
impl PollChannel for HttpPollChannel {
    async fn fetch_snapshot(&self, session_id: &str) -> SyncResult<Snapshot> {
        // Stamped when asked: the response can be no newer than this.
        let observed_at = Utc::now();
        let (mut logs, mut artifacts) = futures::future::try_join(
            self.get_collection("logs", session_id),
            self.get_collection("artifacts", session_id),
        )
        .await?;

        let mut snapshot = Snapshot::new(session_id, SnapshotOrigin::Poll);
        snapshot.status = logs.status.or(artifacts.status);
        snapshot.logs = logs.items::<LogEntry>(session_id, "log");
        snapshot.artifacts = artifacts.items::<Artifact>(session_id, "artifact");
        snapshot.title = artifacts.title.take().or(logs.title.take());
        snapshot.total_expected = artifacts.total_count.or(logs.total_count);
        snapshot.observed_at = observed_at;

        debug!(
            target = "genboard::poll",
            session_id,
            status = ?snapshot.status,
            logs = snapshot.logs.len(),
            artifacts = snapshot.artifacts.len(),
            "snapshot fetched"
        );
        Ok(snapshot)
    }
}
