use crate::model::GenerationSession;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, error};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Updated(GenerationSession),
    Reset(String),
    Removed(String),
    AuthRejected { session_id: String, reason: String },
}

impl StoreEvent {
    pub fn session_id(&self) -> &str {
        match self {
            StoreEvent::Updated(session) => &session.session_id,
            StoreEvent::Reset(id) | StoreEvent::Removed(id) => id,
            StoreEvent::AuthRejected { session_id, .. } => session_id,
        }
    }
}

/// Canonical per-session state. Holds values; the reconciler decides what they are.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, GenerationSession>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn get(&self, session_id: &str) -> Option<GenerationSession> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn set(&self, session: GenerationSession) {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        self.notify(StoreEvent::Updated(session));
    }

    /// Replaces whatever was held for `session_id` with an empty idle session.
    pub fn reset(&self, session_id: &str) -> GenerationSession {
        let fresh = GenerationSession::new(session_id);
        self.sessions
            .write()
            .insert(session_id.to_string(), fresh.clone());
        debug!(target = "genboard::store", session_id, "session reset");
        self.notify(StoreEvent::Reset(session_id.to_string()));
        fresh
    }

    pub fn remove(&self, session_id: &str) -> Option<GenerationSession> {
        let removed = self.sessions.write().remove(session_id);
        if removed.is_some() {
            self.notify(StoreEvent::Removed(session_id.to_string()));
        }
        removed
    }

    /// Applies `transition` to the held session under the write lock. Subscribers are only
    /// told when the value actually changed. Returns the resulting session.
    pub fn update<F>(&self, session_id: &str, transition: F) -> Option<GenerationSession>
    where
        F: FnOnce(&GenerationSession) -> GenerationSession,
    {
        let (next, changed) = {
            let mut sessions = self.sessions.write();
            let current = sessions.get_mut(session_id)?;
            let next = transition(current);
            let changed = next != *current;
            if changed {
                *current = next.clone();
            }
            (next, changed)
        };
        if changed {
            self.notify(StoreEvent::Updated(next.clone()));
        }
        Some(next)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn report_auth_failure(&self, session_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        error!(
            target = "genboard::store",
            session_id,
            reason = %reason,
            "authentication rejected, abandoning session"
        );
        self.notify(StoreEvent::AuthRejected {
            session_id: session_id.to_string(),
            reason,
        });
    }

    /// Resolves once `predicate` holds for the session, or with `None` if the session is
    /// removed first.
    pub async fn wait_for<P>(&self, session_id: &str, mut predicate: P) -> Option<GenerationSession>
    where
        P: FnMut(&GenerationSession) -> bool,
    {
        let mut events = self.subscribe();
        loop {
            match self.get(session_id) {
                Some(session) if predicate(&session) => return Some(session),
                Some(_) => {}
                None => return None,
            }
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Removed(id)) if id == session_id => return None,
                    Ok(event) if event.session_id() == session_id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine; nobody is rendering yet.
        let _ = self.events.send(event);
    }
}
