//! Pure merge functions. Every state transition of a [`GenerationSession`] goes through here.
//!
//! None of these functions perform I/O. Transitions are stamped with the instant the
//! caller observed them, so a merge gives the same answer whatever order events arrive in.

use crate::model::{
    ChannelEvent, GenerationSession, LogEntry, LogRole, OptimisticEcho, SessionStatus, Snapshot,
    StreamChunk, StreamResult,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    dedup_window: Duration,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl Reconciler {
    pub fn new(dedup_window: Duration) -> Self {
        Self { dedup_window }
    }

    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    pub fn apply(&self, current: &GenerationSession, event: &ChannelEvent) -> GenerationSession {
        match event {
            ChannelEvent::Push(snapshot) | ChannelEvent::Poll(snapshot) => {
                self.merge_snapshot(current, snapshot)
            }
            ChannelEvent::Chunk(chunk) => self.apply_chunk(current, chunk),
            ChannelEvent::Result(result) => self.apply_result(current, result, Utc::now()),
            ChannelEvent::Echo { session_id, echo } => {
                if session_id != &current.session_id {
                    return current.clone();
                }
                self.apply_echo(current, echo)
            }
        }
    }

    pub fn merge_snapshot(
        &self,
        current: &GenerationSession,
        incoming: &Snapshot,
    ) -> GenerationSession {
        if incoming.session_id != current.session_id {
            debug!(
                target = "genboard::reconciler",
                session_id = %current.session_id,
                foreign = %incoming.session_id,
                "ignoring snapshot for another session"
            );
            return current.clone();
        }

        let stale = current
            .last_snapshot_at
            .is_some_and(|seen| incoming.observed_at < seen);
        let has_new_data = has_new_data(current, incoming);

        let mut next = current.clone();
        next.logs = self.union_logs(current, &incoming.logs, !stale);

        if stale {
            debug!(
                target = "genboard::reconciler",
                session_id = %current.session_id,
                origin = ?incoming.origin,
                "stale snapshot, keeping status and artifacts"
            );
        } else {
            next.status = resolve_status(current.status, incoming.status, has_new_data);
            // A finished session keeps the results it finished with.
            if !current.status.is_terminal() {
                if !incoming.artifacts.is_empty() {
                    next.artifacts = incoming.artifacts.clone();
                }
                if let Some(title) = incoming.title.as_ref().filter(|t| !t.trim().is_empty()) {
                    next.title = Some(title.clone());
                }
                if let Some(total) = incoming.total_expected.filter(|total| *total > 0) {
                    next.total_expected = Some(total);
                }
            }
            next.last_snapshot_at = Some(incoming.observed_at);
            if next.status != current.status {
                debug!(
                    target = "genboard::reconciler",
                    session_id = %current.session_id,
                    from = %current.status,
                    to = %next.status,
                    origin = ?incoming.origin,
                    "status advanced"
                );
            }
        }

        finish(current, next, incoming.observed_at)
    }

    /// Drops every optimistic echo the server has already confirmed and returns one
    /// timeline ordered by timestamp. Ties keep their relative order.
    pub fn merge_optimistic(&self, real: &[LogEntry], optimistic: &[LogEntry]) -> Vec<LogEntry> {
        let window_ms = self.dedup_window.as_millis() as i64;

        let pending = optimistic.iter().filter(|echo| {
            let Some(content) = echo.content().map(str::trim) else {
                return true;
            };
            !real.iter().any(|entry| {
                entry.role == LogRole::User
                    && entry.content().map(str::trim) == Some(content)
                    && (entry.timestamp - echo.timestamp).num_milliseconds().abs() <= window_ms
            })
        });

        let mut merged: Vec<LogEntry> = real.iter().cloned().chain(pending.cloned()).collect();
        merged.sort_by_key(|entry| entry.timestamp);
        merged
    }

    pub fn apply_chunk(&self, current: &GenerationSession, chunk: &StreamChunk) -> GenerationSession {
        if chunk.session_id != current.session_id {
            return current.clone();
        }
        if current.status.is_terminal() {
            debug!(
                target = "genboard::reconciler",
                session_id = %current.session_id,
                step = %chunk.step,
                status = %current.status,
                "dropping chunk for finished epoch"
            );
            return current.clone();
        }

        let mut next = current.clone();
        let entry = chunk.clone().into_log_entry();
        if !next.logs.iter().any(|existing| existing.id == entry.id) {
            next.logs.push(entry);
        }
        next.status = SessionStatus::Processing;
        next.ack_pending = false;
        next.ack_deadline = None;
        finish(current, next, chunk.timestamp)
    }

    pub fn apply_result(
        &self,
        current: &GenerationSession,
        result: &StreamResult,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        if result.session_id != current.session_id || current.status == SessionStatus::Cancelled {
            return current.clone();
        }

        let mut next = current.clone();
        next.artifacts = result.rows.clone();
        next.columns = result.columns.clone();
        next.result_metadata = result.metadata.clone();
        if let Some(conversation_id) = &result.conversation_id {
            next.conversation_id = Some(conversation_id.clone());
        }
        if let Some(total) = result
            .metadata
            .as_ref()
            .and_then(|meta| meta.get("totalCount").or_else(|| meta.get("total_count")))
            .and_then(|value| value.as_u64())
        {
            next.total_expected = Some(total);
        }
        next.status = SessionStatus::Completed;
        next.ack_pending = false;
        next.ack_deadline = None;
        finish(current, next, at)
    }

    pub fn apply_echo(&self, current: &GenerationSession, echo: &OptimisticEcho) -> GenerationSession {
        if current.logs.iter().any(|entry| entry.id == echo.temp_id) {
            return current.clone();
        }
        let real: Vec<LogEntry> = current.real_logs().cloned().collect();
        let mut optimistic: Vec<LogEntry> = current.optimistic_logs().cloned().collect();
        optimistic.push(echo.to_log_entry());

        let mut next = current.clone();
        next.logs = self.merge_optimistic(&real, &optimistic);
        finish(current, next, echo.timestamp)
    }

    /// Opens a new generation epoch for a just-sent command.
    pub fn begin_epoch(
        &self,
        current: &GenerationSession,
        echo: &OptimisticEcho,
        ack_deadline: DateTime<Utc>,
    ) -> GenerationSession {
        let mut next = self.apply_echo(current, echo);
        next.status = SessionStatus::Processing;
        next.ack_pending = true;
        next.ack_deadline = Some(ack_deadline);
        next.epoch = current.epoch + 1;
        next.warning = None;
        finish(current, next, echo.timestamp)
    }

    pub fn acknowledge(&self, current: &GenerationSession, epoch: u64, at: DateTime<Utc>) -> GenerationSession {
        if current.epoch != epoch || !current.ack_pending {
            return current.clone();
        }
        let mut next = current.clone();
        next.ack_pending = false;
        next.ack_deadline = None;
        finish(current, next, at)
    }

    /// Fail-open: the ack window closes even if the transport never answered.
    pub fn expire_ack(&self, current: &GenerationSession, epoch: u64, at: DateTime<Utc>) -> GenerationSession {
        if current.ack_pending && current.epoch == epoch {
            debug!(
                target = "genboard::reconciler",
                session_id = %current.session_id,
                epoch,
                "ack deadline elapsed"
            );
        }
        self.acknowledge(current, epoch, at)
    }

    /// Undoes a command whose transport failed before the backend acknowledged it.
    pub fn rollback_command(
        &self,
        current: &GenerationSession,
        epoch: u64,
        temp_id: &str,
        prior_status: SessionStatus,
        warning: impl Into<String>,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        if current.epoch != epoch {
            return current.clone();
        }
        let mut next = current.clone();
        next.logs.retain(|entry| entry.id != temp_id);
        next.status = prior_status;
        next.ack_pending = false;
        next.ack_deadline = None;
        next.warning = Some(warning.into());
        finish(current, next, at)
    }

    /// The backend refused the prompt. Nothing was generated, so the session goes back to
    /// ready-for-input rather than claiming completion.
    pub fn reject_command(
        &self,
        current: &GenerationSession,
        epoch: u64,
        temp_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        if current.epoch != epoch {
            return current.clone();
        }
        let mut next = current.clone();
        next.logs.retain(|entry| entry.id != temp_id);
        next.status = SessionStatus::Idle;
        next.ack_pending = false;
        next.ack_deadline = None;
        next.warning = Some(format!("prompt rejected: {reason}"));
        finish(current, next, at)
    }

    pub fn fail_epoch(
        &self,
        current: &GenerationSession,
        epoch: u64,
        reason: &str,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        if current.epoch != epoch || current.status.is_terminal() {
            return current.clone();
        }
        let mut next = current.clone();
        next.status = SessionStatus::Error;
        next.ack_pending = false;
        next.ack_deadline = None;
        next.warning = Some(reason.to_string());
        finish(current, next, at)
    }

    pub fn cancel_epoch(&self, current: &GenerationSession, at: DateTime<Utc>) -> GenerationSession {
        if !matches!(
            current.status,
            SessionStatus::Processing | SessionStatus::Checking
        ) {
            return current.clone();
        }
        let mut next = current.clone();
        next.status = SessionStatus::Cancelled;
        next.ack_pending = false;
        next.ack_deadline = None;
        finish(current, next, at)
    }

    pub fn warn(&self, current: &GenerationSession, message: impl Into<String>, at: DateTime<Utc>) -> GenerationSession {
        let mut next = current.clone();
        next.warning = Some(message.into());
        finish(current, next, at)
    }

    pub fn dismiss_warning(&self, current: &GenerationSession, at: DateTime<Utc>) -> GenerationSession {
        let mut next = current.clone();
        next.warning = None;
        finish(current, next, at)
    }

    /// Marks the session as checking while the first history fetch is outstanding.
    pub fn begin_initial_fetch(&self, current: &GenerationSession, at: DateTime<Utc>) -> GenerationSession {
        if current.initial_fetch_done || current.status != SessionStatus::Idle {
            return current.clone();
        }
        let mut next = current.clone();
        next.status = SessionStatus::Checking;
        finish(current, next, at)
    }

    pub fn complete_initial_fetch(
        &self,
        current: &GenerationSession,
        snapshot: Option<&Snapshot>,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        let mut next = match snapshot {
            Some(snapshot) => self.merge_snapshot(current, snapshot),
            None => current.clone(),
        };
        next.initial_fetch_done = true;
        if next.status == SessionStatus::Checking {
            next.status = SessionStatus::Idle;
        }
        finish(current, next, at)
    }

    /// History could not be loaded. The session stays usable and the fetch is retried on
    /// the next push connect.
    pub fn abort_initial_fetch(
        &self,
        current: &GenerationSession,
        warning: impl Into<String>,
        at: DateTime<Utc>,
    ) -> GenerationSession {
        let mut next = current.clone();
        if next.status == SessionStatus::Checking {
            next.status = SessionStatus::Idle;
        }
        next.warning = Some(warning.into());
        finish(current, next, at)
    }

    fn union_logs(&self, current: &GenerationSession, incoming: &[LogEntry], refresh: bool) -> Vec<LogEntry> {
        let mut real: Vec<LogEntry> = current.real_logs().cloned().collect();
        let index: HashMap<String, usize> = real
            .iter()
            .enumerate()
            .map(|(pos, entry)| (entry.id.clone(), pos))
            .collect();

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for entry in incoming {
            if !seen.insert(entry.id.as_str()) {
                continue;
            }
            match index.get(&entry.id) {
                Some(&pos) if refresh => {
                    real[pos] = LogEntry {
                        is_optimistic: false,
                        ..entry.clone()
                    };
                }
                Some(_) => {}
                None => fresh.push(LogEntry {
                    is_optimistic: false,
                    ..entry.clone()
                }),
            }
        }
        fresh.sort_by_key(|entry| entry.timestamp);
        real.extend(fresh);

        let optimistic: Vec<LogEntry> = current.optimistic_logs().cloned().collect();
        if optimistic.is_empty() {
            real
        } else {
            self.merge_optimistic(&real, &optimistic)
        }
    }
}

/// A snapshot only counts as progress when it brings log entries we have never seen or a
/// different artifact set.
fn has_new_data(current: &GenerationSession, incoming: &Snapshot) -> bool {
    let known: HashSet<&str> = current.real_logs().map(|entry| entry.id.as_str()).collect();
    let new_logs = incoming
        .logs
        .iter()
        .any(|entry| !known.contains(entry.id.as_str()));
    let new_artifacts =
        !incoming.artifacts.is_empty() && incoming.artifacts.len() != current.artifacts.len();
    new_logs || new_artifacts
}

fn resolve_status(
    current: SessionStatus,
    incoming: Option<SessionStatus>,
    has_new_data: bool,
) -> SessionStatus {
    if current.is_terminal() {
        return current;
    }
    match (current, incoming) {
        (SessionStatus::Processing, Some(SessionStatus::Failed)) => SessionStatus::Failed,
        (SessionStatus::Processing, Some(SessionStatus::Completed)) if !has_new_data => {
            SessionStatus::Processing
        }
        (_, Some(status)) => status,
        (status, None) => status,
    }
}

fn finish(
    current: &GenerationSession,
    mut next: GenerationSession,
    at: DateTime<Utc>,
) -> GenerationSession {
    if next == *current {
        return next;
    }
    next.last_updated = Some(match current.last_updated {
        Some(previous) if previous > at => previous,
        _ => at,
    });
    next
}
