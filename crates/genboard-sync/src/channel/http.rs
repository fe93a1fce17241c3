use crate::error::{SyncError, SyncResult};
use reqwest::{RequestBuilder, Response};
use std::time::Duration;
use url::Url;

/// Base URL plus credentials shared by the poll and command transports.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    base_url: Url,
    bearer_token: Option<String>,
}

impl ApiEndpoint {
    pub fn new(base_url: Url, bearer_token: Option<String>) -> Self {
        Self {
            base_url,
            bearer_token,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer_token.as_deref()
    }

    /// `{base}/{collection}/{session_id}`, with the id kept as a single path segment.
    pub(crate) fn resource(&self, collection: &str, session_id: &str) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                SyncError::InvalidConfig(format!(
                    "API base {} cannot hold a {collection} path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(collection.split('/'))
            .push(session_id);
        Ok(url)
    }

    pub(crate) fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// `request_timeout` of `None` leaves the total request time unbounded, which streamed
/// responses need.
pub(crate) fn build_client(
    connect_timeout: Duration,
    request_timeout: Option<Duration>,
) -> SyncResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .no_proxy();
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

pub(crate) async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::from_status(status, body))
}
