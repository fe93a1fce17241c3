//! End-to-end runs of a session view against an in-process backend serving the poll and
//! command endpoints.

use axum::body::Body;
use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use genboard_sync::{
    ApiEndpoint, CommandMode, HttpCommandTransport, HttpPollChannel, LogRole, OfflinePush,
    SessionStatus, SessionStore, SessionView, SyncTimings,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use url::Url;

/// What the fake backend reports from its history endpoints.
#[derive(Default)]
struct Job {
    status: Option<&'static str>,
    logs: Vec<Value>,
    rows: Vec<Value>,
}

type Backend = Arc<Mutex<Job>>;

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn logs(State(job): State<Backend>) -> Json<Value> {
    let job = job.lock().await;
    Json(json!({ "status": job.status, "data": job.logs }))
}

async fn artifacts(State(job): State<Backend>) -> Json<Value> {
    let job = job.lock().await;
    Json(json!({ "status": job.status, "data": job.rows, "totalCount": job.rows.len() }))
}

fn ndjson(records: Vec<Value>) -> Vec<Result<Bytes, std::io::Error>> {
    records
        .into_iter()
        .map(|record| Ok(Bytes::from(format!("{record}\n"))))
        .collect()
}

fn generation_records() -> Vec<Value> {
    let rows: Vec<Value> = (0..12)
        .map(|i| json!({ "company": format!("startup-{i}"), "stage": "seed" }))
        .collect();
    vec![
        json!({ "step": "validation", "data": { "valid": true }, "timestamp": now_millis() }),
        json!({ "step": "llm_processing", "data": { "agent": "researcher", "content": "collecting rows" }, "timestamp": now_millis() + 1 }),
        json!({
            "conversationId": "c-42",
            "response": {
                "rows": rows,
                "columns": ["company", "stage", "country", "founded", "raised"],
                "metadata": { "source": "web" }
            }
        }),
    ]
}

async fn serve(router: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

fn fast_timings() -> SyncTimings {
    SyncTimings {
        poll_interval: Duration::from_millis(50),
        ack_timeout: Duration::from_secs(2),
        ..SyncTimings::default()
    }
}

fn view_for(base: Url) -> SessionView {
    let timings = fast_timings();
    let endpoint = ApiEndpoint::new(base, None);
    SessionView::new(
        Arc::new(SessionStore::new()),
        Arc::new(OfflinePush),
        Arc::new(HttpPollChannel::new(endpoint.clone(), &timings).unwrap()),
        Arc::new(HttpCommandTransport::new(endpoint, &timings).unwrap()),
        &timings,
    )
}

#[test_timeout::tokio_timeout_test(30)]
async fn streamed_generation_completes_with_every_row() {
    let job: Backend = Arc::default();
    let router = Router::new()
        .route("/logs/:id", get(logs))
        .route("/artifacts/:id", get(artifacts))
        .route(
            "/create/:id",
            post(|Path(_id): Path<String>, Json(_body): Json<Value>| async move {
                Body::from_stream(futures::stream::iter(ndjson(generation_records())))
            }),
        )
        .with_state(Arc::clone(&job));
    let view = view_for(serve(router).await);

    let opened = view.open("s1").await.unwrap();
    assert_eq!(opened.status, SessionStatus::Idle);
    assert!(opened.initial_fetch_done);

    view.send("a list of 12 seed startups", CommandMode::Streamed)
        .await
        .unwrap();
    let done = view
        .store()
        .wait_for("s1", |s| s.status == SessionStatus::Completed)
        .await
        .unwrap();

    assert_eq!(done.artifacts.len(), 12);
    assert_eq!(done.columns.len(), 5);
    assert_eq!(done.conversation_id.as_deref(), Some("c-42"));
    assert!(!done.ack_pending);
    let steps: Vec<&str> = done
        .real_logs()
        .filter(|entry| entry.role == LogRole::Agent)
        .map(|entry| entry.message_type.as_str())
        .collect();
    assert_eq!(steps, vec!["validation", "llm_processing"]);
    assert_eq!(done.optimistic_logs().count(), 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn leaving_mid_stream_keeps_the_job_and_reopening_resumes_polling() {
    let job: Backend = Arc::default();
    let router = Router::new()
        .route("/logs/:id", get(logs))
        .route("/artifacts/:id", get(artifacts))
        .route(
            "/create/:id",
            post({
                let job = Arc::clone(&job);
                move |Path(_id): Path<String>, Json(_body): Json<Value>| {
                    let job = Arc::clone(&job);
                    async move {
                        job.lock().await.status = Some("processing");
                        let first = ndjson(vec![json!({
                            "step": "validation",
                            "data": { "valid": true },
                            "timestamp": now_millis()
                        })]);
                        // The generation keeps running; the body never ends.
                        Body::from_stream(
                            futures::StreamExt::chain(
                                futures::stream::iter(first),
                                futures::stream::pending(),
                            ),
                        )
                    }
                }
            }),
        )
        .with_state(Arc::clone(&job));
    let view = view_for(serve(router).await);

    view.open("s1").await.unwrap();
    view.send("twelve startups", CommandMode::Streamed)
        .await
        .unwrap();
    view.store()
        .wait_for("s1", |s| s.real_logs().count() == 1 && !s.ack_pending)
        .await
        .unwrap();

    assert_eq!(view.close().as_deref(), Some("s1"));
    let left = view.store().get("s1").unwrap();
    assert_eq!(left.status, SessionStatus::Processing);
    assert!(left.warning.is_none());

    let reopened = view.open("s1").await.unwrap();
    assert_eq!(reopened.status, SessionStatus::Processing);
    assert!(view.is_polling());
    assert!(!view.is_streaming());

    {
        let mut job = job.lock().await;
        job.status = Some("completed");
        job.rows = (0..3).map(|i| json!({ "row": i })).collect();
    }
    let finished = view
        .store()
        .wait_for("s1", |s| s.status == SessionStatus::Completed)
        .await
        .unwrap();
    assert_eq!(finished.artifacts.len(), 3);
    assert_eq!(finished.total_expected, Some(3));
}

#[test_timeout::tokio_timeout_test(30)]
async fn confirmed_message_replaces_its_echo() {
    let job: Backend = Arc::default();
    let router = Router::new()
        .route("/logs/:id", get(logs))
        .route("/artifacts/:id", get(artifacts))
        .route(
            "/chat/message/:id",
            post({
                let job = Arc::clone(&job);
                move |Path(_id): Path<String>, Json(body): Json<Value>| {
                    let job = Arc::clone(&job);
                    async move {
                        let query = body["query"].as_str().unwrap_or_default().to_string();
                        let mut job = job.lock().await;
                        job.status = Some("processing");
                        job.logs.push(json!({
                            "id": "u-1",
                            "role": "user",
                            "content": query,
                            "timestamp": now_millis()
                        }));
                        StatusCode::ACCEPTED.into_response()
                    }
                }
            }),
        )
        .with_state(Arc::clone(&job));
    let view = view_for(serve(router).await);

    view.open("s1").await.unwrap();
    view.send("make the title shorter", CommandMode::FireAndForget)
        .await
        .unwrap();
    let acked = view.current().unwrap();
    assert_eq!(acked.status, SessionStatus::Processing);
    assert!(!acked.ack_pending);

    {
        let mut job = job.lock().await;
        job.logs.push(json!({
            "id": "a-1",
            "role": "agent",
            "agentName": "editor",
            "content": "done",
            "timestamp": now_millis()
        }));
        job.status = Some("completed");
    }
    let done = view
        .store()
        .wait_for("s1", |s| s.status == SessionStatus::Completed)
        .await
        .unwrap();

    assert_eq!(done.optimistic_logs().count(), 0);
    let ids: Vec<&str> = done.logs.iter().map(|entry| entry.id.as_str()).collect();
    assert_eq!(ids, vec!["u-1", "a-1"]);
}
