use genboard_sync::{GenerationSession, LogEntry, LogRole, SessionStatus, SessionStore, StoreEvent};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const PREVIEW_ROWS: usize = 3;
const MAX_LINE: usize = 160;

/// Turns successive session states into the lines not printed yet.
#[derive(Debug, Default)]
pub struct Timeline {
    printed: HashSet<String>,
    status: Option<SessionStatus>,
    warning: Option<String>,
}

impl Timeline {
    pub fn render(&mut self, session: &GenerationSession) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in session.real_logs() {
            if self.printed.insert(entry.id.clone()) {
                lines.push(log_line(entry));
            }
        }
        if session.warning != self.warning {
            if let Some(warning) = &session.warning {
                lines.push(format!("! {warning}"));
            }
            self.warning = session.warning.clone();
        }
        if self.status != Some(session.status) {
            lines.push(format!("-- {}", session.status.label()));
            self.status = Some(session.status);
        }
        lines
    }
}

/// Nothing more will happen without another command.
pub fn is_settled(session: &GenerationSession) -> bool {
    if session.ack_pending {
        return false;
    }
    session.status.is_terminal()
        || matches!(session.status, SessionStatus::Idle | SessionStatus::Error)
}

pub fn summary(session: &GenerationSession) -> Vec<String> {
    let mut lines = Vec::new();
    if session.artifacts.is_empty() {
        return lines;
    }
    let expected = session
        .total_expected
        .map(|total| format!(" of {total}"))
        .unwrap_or_default();
    lines.push(format!("{}{expected} artifacts", session.artifacts.len()));
    if !session.columns.is_empty() {
        let columns: Vec<String> = session.columns.iter().map(display_value).collect();
        lines.push(format!("columns: {}", columns.join(", ")));
    }
    for artifact in session.artifacts.iter().take(PREVIEW_ROWS) {
        lines.push(format!("  {}", truncate(&artifact.0.to_string())));
    }
    if session.artifacts.len() > PREVIEW_ROWS {
        lines.push(format!("  ... {} more", session.artifacts.len() - PREVIEW_ROWS));
    }
    lines
}

/// Prints the timeline as it changes. Returns the session once it settles, or `None` if
/// `shutdown` fired first.
pub async fn follow(
    store: Arc<SessionStore>,
    session_id: String,
    shutdown: CancellationToken,
) -> Option<GenerationSession> {
    let mut events = store.subscribe();
    let mut timeline = Timeline::default();
    loop {
        let session = store.get(&session_id)?;
        for line in timeline.render(&session) {
            println!("{line}");
        }
        if is_settled(&session) {
            return Some(session);
        }
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                event = events.recv() => match event {
                    Ok(StoreEvent::Updated(updated)) if updated.session_id == session_id => break,
                    Ok(StoreEvent::Reset(id)) | Ok(StoreEvent::Removed(id)) if id == session_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}

fn log_line(entry: &LogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S");
    let body = entry
        .content()
        .map(str::to_string)
        .unwrap_or_else(|| display_value(&entry.payload));
    match entry.role {
        LogRole::User => format!("[{time}] > {}", truncate(&body)),
        LogRole::Agent => format!("[{time}] {}: {}", entry.author_name, truncate(&body)),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(text: &str) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= MAX_LINE {
        return single_line;
    }
    let mut cut: String = single_line.chars().take(MAX_LINE).collect();
    cut.push_str("...");
    cut
}
