//! Session state and the channel events that feed the reconciler.
//!
//! Everything here is plain data. Invariants are enforced by [`crate::reconciler`];
//! the store and the channels only carry these values around.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Checking,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Error,
    Saved,
}

impl SessionStatus {
    /// Statuses that halt polling and freeze the epoch until a new command starts.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Failed
                | SessionStatus::Cancelled
                | SessionStatus::Saved
        )
    }

    /// Maps the backend's status vocabulary onto ours. Unknown words are treated as absent.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => SessionStatus::Idle,
            "checking" => SessionStatus::Checking,
            "processing" | "pending" | "running" | "in_progress" | "generating" => {
                SessionStatus::Processing
            }
            "completed" | "complete" | "done" | "success" => SessionStatus::Completed,
            "failed" | "failure" => SessionStatus::Failed,
            "cancelled" | "canceled" => SessionStatus::Cancelled,
            "error" => SessionStatus::Error,
            "saved" => SessionStatus::Saved,
            _ => return None,
        };
        Some(status)
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Checking => "checking",
            SessionStatus::Processing => "processing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Error => "error",
            SessionStatus::Saved => "saved",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        SessionStatus::from_wire(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown session status '{raw}'")))
    }
}

/// Lenient status field: absent, null or an unknown word all become `None`.
pub(crate) fn deserialize_optional_status<'de, D>(
    deserializer: D,
) -> Result<Option<SessionStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(SessionStatus::from_wire))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogRole {
    User,
    Agent,
}

impl Serialize for LogRole {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(match self {
            LogRole::User => "user",
            LogRole::Agent => "agent",
        })
    }
}

impl<'de> Deserialize<'de> for LogRole {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        if raw.trim().eq_ignore_ascii_case("user") {
            Ok(LogRole::User)
        } else {
            Ok(LogRole::Agent)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(alias = "_id")]
    pub id: String,
    pub role: LogRole,
    #[serde(default, alias = "author", alias = "agentName")]
    pub author_name: String,
    #[serde(default, alias = "type")]
    pub message_type: String,
    #[serde(default, alias = "content", alias = "data")]
    pub payload: Value,
    #[serde(alias = "createdAt", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_optimistic: bool,
}

impl LogEntry {
    /// Text the user or agent actually said, if the payload carries any.
    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            Value::String(text) => Some(text.as_str()),
            Value::Object(map) => ["content", "text", "message", "query"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str)),
            _ => None,
        }
    }
}

/// One produced record (slide, row, ad). The shape belongs to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Artifact(pub Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOrigin {
    Push,
    Poll,
}

/// A full `{status, logs, artifacts}` read of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub session_id: String,
    pub origin: SnapshotOrigin,
    pub status: Option<SessionStatus>,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub title: Option<String>,
    pub total_expected: Option<u64>,
    /// When the read was taken: request time for polls, arrival time for pushes.
    pub observed_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(session_id: impl Into<String>, origin: SnapshotOrigin) -> Self {
        Self {
            session_id: session_id.into(),
            origin,
            status: None,
            logs: Vec::new(),
            artifacts: Vec::new(),
            title: None,
            total_expected: None,
            observed_at: Utc::now(),
        }
    }
}

/// One progress record decoded from a streamed command response.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamChunk {
    pub session_id: String,
    pub sequence: u64,
    pub step: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamChunk {
    /// Deterministic, so a re-delivered chunk never lands in the timeline twice.
    pub fn log_id(&self) -> String {
        format!(
            "stream:{}:{}:{}:{}",
            self.session_id,
            self.step,
            self.timestamp.timestamp_millis(),
            self.sequence
        )
    }

    pub fn into_log_entry(self) -> LogEntry {
        let id = self.log_id();
        let author_name = self
            .payload
            .get("agent")
            .and_then(Value::as_str)
            .unwrap_or(&self.step)
            .to_string();
        LogEntry {
            id,
            role: LogRole::Agent,
            author_name,
            message_type: self.step,
            payload: self.payload,
            timestamp: self.timestamp,
            is_optimistic: false,
        }
    }
}

/// The terminal record of a streamed command.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamResult {
    pub session_id: String,
    pub conversation_id: Option<String>,
    pub rows: Vec<Artifact>,
    pub columns: Vec<Value>,
    pub metadata: Option<Value>,
}

/// Locally fabricated stand-in for a just-sent user command.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEcho {
    pub temp_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl OptimisticEcho {
    pub fn new(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            temp_id: format!("optimistic-{}", uuid::Uuid::new_v4()),
            content: content.into(),
            timestamp,
        }
    }

    pub fn to_log_entry(&self) -> LogEntry {
        LogEntry {
            id: self.temp_id.clone(),
            role: LogRole::User,
            author_name: "you".to_string(),
            message_type: "message".to_string(),
            payload: Value::String(self.content.clone()),
            timestamp: self.timestamp,
            is_optimistic: true,
        }
    }
}

/// Inputs to the reconciler. Channels produce these; they never touch state themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Push(Snapshot),
    Poll(Snapshot),
    Chunk(StreamChunk),
    Result(StreamResult),
    Echo {
        session_id: String,
        echo: OptimisticEcho,
    },
}

impl ChannelEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ChannelEvent::Push(snapshot) | ChannelEvent::Poll(snapshot) => &snapshot.session_id,
            ChannelEvent::Chunk(chunk) => &chunk.session_id,
            ChannelEvent::Result(result) => &result.session_id,
            ChannelEvent::Echo { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSession {
    pub session_id: String,
    pub status: SessionStatus,
    pub logs: Vec<LogEntry>,
    pub artifacts: Vec<Artifact>,
    pub columns: Vec<Value>,
    pub result_metadata: Option<Value>,
    pub conversation_id: Option<String>,
    pub title: Option<String>,
    pub total_expected: Option<u64>,
    pub ack_pending: bool,
    pub ack_deadline: Option<DateTime<Utc>>,
    /// Bumped by every command; timers and readers only ever touch their own epoch.
    pub epoch: u64,
    pub initial_fetch_done: bool,
    /// Observation stamp of the newest snapshot whose status was considered.
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub warning: Option<String>,
}

impl GenerationSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            status: SessionStatus::Idle,
            logs: Vec::new(),
            artifacts: Vec::new(),
            columns: Vec::new(),
            result_metadata: None,
            conversation_id: None,
            title: None,
            total_expected: None,
            ack_pending: false,
            ack_deadline: None,
            epoch: 0,
            initial_fetch_done: false,
            last_snapshot_at: None,
            last_updated: None,
            warning: None,
        }
    }

    pub fn is_mid_epoch(&self) -> bool {
        self.status == SessionStatus::Processing
    }

    pub fn real_logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter().filter(|entry| !entry.is_optimistic)
    }

    pub fn optimistic_logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter().filter(|entry| entry.is_optimistic)
    }
}

/// Accepts epoch milliseconds, epoch seconds (integer or float) and ISO-8601 strings,
/// with or without an offset. Always serializes as RFC 3339.
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    const SECONDS_CUTOFF: i64 = 100_000_000_000;

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        from_value(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp {raw}")))
    }

    pub fn from_value(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::Number(number) => {
                if let Some(whole) = number.as_i64() {
                    from_integer(whole)
                } else {
                    number
                        .as_f64()
                        .and_then(|secs| Utc.timestamp_millis_opt((secs * 1000.0) as i64).single())
                }
            }
            Value::String(text) => from_text(text),
            _ => None,
        }
    }

    fn from_integer(value: i64) -> Option<DateTime<Utc>> {
        if value.abs() < SECONDS_CUTOFF {
            Utc.timestamp_opt(value, 0).single()
        } else {
            Utc.timestamp_millis_opt(value).single()
        }
    }

    fn from_text(text: &str) -> Option<DateTime<Utc>> {
        let trimmed = text.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(parsed.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&naive));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
            return Some(Utc.from_utc_datetime(&naive));
        }
        trimmed.parse::<i64>().ok().and_then(from_integer)
    }
}
