//! Server-initiated updates over a WebSocket.
//!
//! A supervisor task owns the socket. It reconnects with capped exponential backoff, sends a
//! heartbeat ping, and forwards decoded frames to the consumer as [`PushEvent`]s. Rooms joined
//! on a dead connection are forgotten, so the next `join` after `Connected` is re-sent.

use super::decode_records;
use crate::error::{SyncError, SyncResult};
use crate::model::{deserialize_optional_status, Artifact, LogEntry, SessionStatus, Snapshot, SnapshotOrigin};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Connected,
    Disconnected { reason: String },
    Update(Snapshot),
    AuthError(String),
}

/// Room membership on the push connection. Both calls are idempotent and never block.
pub trait PushChannel: Send + Sync {
    fn join(&self, session_id: &str);
    fn leave(&self, session_id: &str);
}

#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: Url,
    pub credentials: Option<String>,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Join {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Leave {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Ping,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Update(UpdateFrame),
    Error {
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFrame {
    session_id: String,
    #[serde(default, deserialize_with = "deserialize_optional_status")]
    status: Option<SessionStatus>,
    #[serde(default)]
    logs: Vec<Value>,
    #[serde(default)]
    artifacts: Vec<Value>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "total_count")]
    total_count: Option<u64>,
}

impl UpdateFrame {
    fn into_snapshot(self) -> Snapshot {
        let mut snapshot = Snapshot::new(self.session_id, SnapshotOrigin::Push);
        snapshot.status = self.status;
        snapshot.logs = decode_records::<LogEntry>(self.logs, &snapshot.session_id, "log");
        snapshot.artifacts =
            decode_records::<Artifact>(self.artifacts, &snapshot.session_id, "artifact");
        snapshot.title = self.title;
        snapshot.total_expected = self.total_count;
        snapshot.observed_at = Utc::now();
        snapshot
    }
}

pub struct WsPushChannel {
    rooms: Arc<Mutex<HashSet<String>>>,
    frames: mpsc::UnboundedSender<ClientFrame>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsPushChannel {
    /// Starts the connection supervisor. Must be called inside a tokio runtime.
    pub fn connect(settings: PushSettings) -> (Self, mpsc::UnboundedReceiver<PushEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let rooms = Arc::new(Mutex::new(HashSet::new()));
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            settings,
            rooms: Arc::clone(&rooms),
            frames: frames_rx,
            events: events_tx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(supervisor.run());

        (
            Self {
                rooms,
                frames: frames_tx,
                shutdown,
                supervisor: Mutex::new(Some(handle)),
            },
            events_rx,
        )
    }

    pub fn joined(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.lock().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    /// Stops reconnecting and closes the socket. Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self.supervisor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl PushChannel for WsPushChannel {
    fn join(&self, session_id: &str) {
        if !self.rooms.lock().insert(session_id.to_string()) {
            return;
        }
        debug!(target = "genboard::push", session_id, "joining room");
        let _ = self.frames.send(ClientFrame::Join {
            session_id: session_id.to_string(),
        });
    }

    fn leave(&self, session_id: &str) {
        if !self.rooms.lock().remove(session_id) {
            return;
        }
        debug!(target = "genboard::push", session_id, "leaving room");
        let _ = self.frames.send(ClientFrame::Leave {
            session_id: session_id.to_string(),
        });
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Push stand-in when no push endpoint is available. Polling carries every update.
#[derive(Debug, Default)]
pub struct OfflinePush;

impl PushChannel for OfflinePush {
    fn join(&self, _session_id: &str) {}
    fn leave(&self, _session_id: &str) {}
}

enum PumpExit {
    Shutdown,
    Lost(String),
    Auth(String),
}

struct Supervisor {
    settings: PushSettings,
    rooms: Arc<Mutex<HashSet<String>>>,
    frames: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<PushEvent>,
    shutdown: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = open_socket(&self.settings) => attempt,
            };

            match attempt {
                Ok(socket) => {
                    backoff = INITIAL_BACKOFF;
                    info!(target = "genboard::push", url = %self.settings.url, "push connected");
                    self.emit(PushEvent::Connected);
                    let exit = self.pump(socket).await;
                    self.rooms.lock().clear();
                    match exit {
                        PumpExit::Shutdown => break,
                        PumpExit::Auth(reason) => {
                            self.emit(PushEvent::AuthError(reason));
                            break;
                        }
                        PumpExit::Lost(reason) => {
                            warn!(target = "genboard::push", reason = %reason, "push disconnected");
                            self.emit(PushEvent::Disconnected { reason });
                        }
                    }
                }
                Err(SyncError::Auth(reason)) => {
                    warn!(target = "genboard::push", reason = %reason, "push handshake rejected");
                    self.emit(PushEvent::AuthError(reason));
                    break;
                }
                Err(err) => {
                    debug!(
                        target = "genboard::push",
                        error = %err,
                        retry_in_ms = backoff.as_millis() as u64,
                        "push connect failed"
                    );
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.settings.max_backoff);
        }
        debug!(target = "genboard::push", "push supervisor stopped");
    }

    async fn pump(&mut self, socket: Socket) -> PumpExit {
        let (mut sink, mut stream) = socket.split();
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
                frame = self.frames.recv() => {
                    let Some(frame) = frame else {
                        return PumpExit::Shutdown;
                    };
                    if let Err(err) = send_frame(&mut sink, &frame).await {
                        return PumpExit::Lost(err.to_string());
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(err) = send_frame(&mut sink, &ClientFrame::Ping).await {
                        return PumpExit::Lost(err.to_string());
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(exit) = self.handle_text(&text) {
                            return exit;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|frame| frame.reason.to_string())
                            .filter(|reason| !reason.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string());
                        return PumpExit::Lost(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                    None => return PumpExit::Lost("connection ended".to_string()),
                }
            }
        }
    }

    fn handle_text(&self, text: &str) -> Option<PumpExit> {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(target = "genboard::push", error = %err, "unreadable push frame");
                return None;
            }
        };
        match frame {
            ServerFrame::Update(update) => {
                let snapshot = update.into_snapshot();
                debug!(
                    target = "genboard::push",
                    session_id = %snapshot.session_id,
                    status = ?snapshot.status,
                    logs = snapshot.logs.len(),
                    artifacts = snapshot.artifacts.len(),
                    "update received"
                );
                self.emit(PushEvent::Update(snapshot));
                None
            }
            ServerFrame::Error { code, message } if matches!(code, Some(401) | Some(403)) => {
                Some(PumpExit::Auth(message))
            }
            ServerFrame::Error { code, message } => {
                warn!(target = "genboard::push", code = ?code, message = %message, "push error frame");
                None
            }
            ServerFrame::Pong | ServerFrame::Unknown => None,
        }
    }

    fn emit(&self, event: PushEvent) {
        // The consumer may already be gone during teardown.
        let _ = self.events.send(event);
    }
}

async fn open_socket(settings: &PushSettings) -> SyncResult<Socket> {
    let mut request = settings
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| SyncError::InvalidConfig(format!("invalid push url: {err}")))?;
    if let Some(token) = &settings.credentials {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| SyncError::InvalidConfig(format!("invalid push credentials: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match tokio::time::timeout(settings.connect_timeout, connect_async(request)).await {
        Err(_) => Err(SyncError::Transport("push connect timed out".into())),
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(tungstenite::Error::Http(response)))
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            Err(SyncError::Auth(format!(
                "push handshake rejected with {}",
                response.status()
            )))
        }
        Ok(Err(err)) => Err(SyncError::Transport(err.to_string())),
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ClientFrame) -> SyncResult<()>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| SyncError::Transport(err.to_string()))
}
