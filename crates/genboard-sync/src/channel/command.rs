use super::http::{build_client, check_status, ApiEndpoint};
use crate::config::SyncTimings;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tracing::debug;

pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    /// Plain request; a 2xx is the ack and progress arrives over push/poll.
    FireAndForget,
    /// The response body is the generation stream.
    Streamed,
}

#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn post_message(&self, session_id: &str, query: &str) -> SyncResult<()>;

    /// Resolves once response headers arrive; the body is returned unread.
    async fn start_generation(&self, session_id: &str, prompt: &str) -> SyncResult<ByteStream>;
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    query: &'a str,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    prompt: &'a str,
}

pub struct HttpCommandTransport {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    endpoint: ApiEndpoint,
}

impl HttpCommandTransport {
    pub fn new(endpoint: ApiEndpoint, timings: &SyncTimings) -> SyncResult<Self> {
        Ok(Self {
            client: build_client(timings.connect_timeout, Some(timings.request_timeout))?,
            stream_client: build_client(timings.connect_timeout, None)?,
            endpoint,
        })
    }
}

#[async_trait]
impl CommandTransport for HttpCommandTransport {
    async fn post_message(&self, session_id: &str, query: &str) -> SyncResult<()> {
        let url = self.endpoint.resource("chat/message", session_id)?;
        let response = self
            .endpoint
            .authorize(self.client.post(url))
            .json(&MessageRequest { query })
            .send()
            .await?;
        let response = check_status(response).await?;
        debug!(
            target = "genboard::dispatcher",
            session_id,
            status = %response.status(),
            "message accepted"
        );
        Ok(())
    }

    async fn start_generation(&self, session_id: &str, prompt: &str) -> SyncResult<ByteStream> {
        let url = self.endpoint.resource("create", session_id)?;
        let response = self
            .endpoint
            .authorize(self.stream_client.post(url))
            .json(&CreateRequest { prompt })
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::stream::{StreamDecoder, StreamRecord};
    use axum::extract::{Json, Path};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;
    use url::Url;

    async fn serve(router: Router) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn message_posts_query_body() {
        let seen: Arc<Mutex<Vec<(String, Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().route(
            "/chat/message/:id",
            post({
                let seen = Arc::clone(&seen);
                move |Path(id): Path<String>, Json(body): Json<Value>| {
                    let seen = Arc::clone(&seen);
                    async move {
                        seen.lock().await.push((id, body));
                        StatusCode::ACCEPTED
                    }
                }
            }),
        );
        let transport = HttpCommandTransport::new(
            ApiEndpoint::new(serve(router).await, None),
            &SyncTimings::default(),
        )
        .unwrap();

        transport.post_message("s1", "make it blue").await.unwrap();
        let seen = seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "s1");
        assert_eq!(seen[0].1["query"], "make it blue");
    }

    #[test_timeout::tokio_timeout_test]
    async fn generation_body_is_returned_as_a_stream() {
        let router = Router::new().route(
            "/create/:id",
            post(|| async {
                "{\"step\":\"validation\",\"data\":{\"valid\":true}}\n\
                 {\"conversationId\":\"c1\",\"response\":{\"rows\":[1,2],\"columns\":[\"n\"]}}\n"
            }),
        );
        let transport = HttpCommandTransport::new(
            ApiEndpoint::new(serve(router).await, None),
            &SyncTimings::default(),
        )
        .unwrap();

        let mut body = transport.start_generation("s1", "budget").await.unwrap();
        let mut decoder = StreamDecoder::new("s1");
        let mut records = Vec::new();
        while let Some(chunk) = body.next().await {
            records.extend(decoder.push(&chunk.unwrap()).into_iter().map(Result::unwrap));
        }
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], StreamRecord::Result(_)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejected_generation_maps_status() {
        let router = Router::new().route(
            "/create/:id",
            post(|| async { (StatusCode::FORBIDDEN, "nope") }),
        );
        let transport = HttpCommandTransport::new(
            ApiEndpoint::new(serve(router).await, Some("t".into())),
            &SyncTimings::default(),
        )
        .unwrap();

        match transport.start_generation("s1", "budget").await {
            Err(SyncError::Auth(reason)) => assert_eq!(reason, "nope"),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("expected rejection"),
        }
    }
}
