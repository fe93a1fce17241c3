use crate::channel::poll::PollChannel;
use crate::channel::push::PushChannel;
use crate::error::{SyncError, SyncResult};
use crate::model::SessionStatus;
use crate::reconciler::Reconciler;
use crate::store::SessionStore;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// No session was displayed; nothing to resume.
    Idle,
    Rejoined { resynced: bool },
    Abandoned,
}

/// Resumes delivery for the displayed session whenever the push channel (re)connects.
pub struct ReconnectionManager {
    store: Arc<SessionStore>,
    push: Arc<dyn PushChannel>,
    poll: Arc<dyn PollChannel>,
    reconciler: Reconciler,
    resyncing: Mutex<HashSet<String>>,
}

struct ResyncGuard<'a> {
    resyncing: &'a Mutex<HashSet<String>>,
    session_id: String,
}

impl<'a> ResyncGuard<'a> {
    fn acquire(resyncing: &'a Mutex<HashSet<String>>, session_id: &str) -> Option<Self> {
        if !resyncing.lock().insert(session_id.to_string()) {
            return None;
        }
        Some(Self {
            resyncing,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for ResyncGuard<'_> {
    fn drop(&mut self) {
        self.resyncing.lock().remove(&self.session_id);
    }
}

impl ReconnectionManager {
    pub fn new(
        store: Arc<SessionStore>,
        push: Arc<dyn PushChannel>,
        poll: Arc<dyn PollChannel>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            store,
            push,
            poll,
            reconciler,
            resyncing: Mutex::new(HashSet::new()),
        }
    }

    /// Re-joins the active room and, if the session may have missed updates while the
    /// connection was down, fetches exactly one snapshot to close the gap.
    pub async fn on_connected(&self, active: Option<&str>) -> SyncResult<ReconnectOutcome> {
        let Some(session_id) = active else {
            return Ok(ReconnectOutcome::Idle);
        };
        self.push.join(session_id);

        let needs_resync = self.store.get(session_id).is_some_and(|session| {
            !session.initial_fetch_done || session.status == SessionStatus::Processing
        });
        if !needs_resync {
            debug!(target = "genboard::reconnect", session_id, "rejoined, no resync needed");
            return Ok(ReconnectOutcome::Rejoined { resynced: false });
        }
        let Some(_guard) = ResyncGuard::acquire(&self.resyncing, session_id) else {
            return Ok(ReconnectOutcome::Rejoined { resynced: false });
        };

        match self.poll.fetch_snapshot(session_id).await {
            Ok(snapshot) => {
                self.store.update(session_id, |s| {
                    if s.initial_fetch_done {
                        self.reconciler.merge_snapshot(s, &snapshot)
                    } else {
                        self.reconciler
                            .complete_initial_fetch(s, Some(&snapshot), Utc::now())
                    }
                });
                info!(target = "genboard::reconnect", session_id, "rejoined and resynced");
                Ok(ReconnectOutcome::Rejoined { resynced: true })
            }
            Err(SyncError::Auth(reason)) => Ok(self.on_auth_error(session_id, &reason)),
            Err(err) => {
                warn!(
                    target = "genboard::reconnect",
                    session_id,
                    error = %err,
                    "resync after reconnect failed"
                );
                Err(err)
            }
        }
    }

    pub fn on_disconnected(&self, active: Option<&str>, reason: &str) {
        warn!(
            target = "genboard::reconnect",
            session_id = active.unwrap_or("-"),
            reason,
            "push connection lost, waiting for reconnect"
        );
    }

    /// Credentials are not retried; the session is given up.
    pub fn on_auth_error(&self, session_id: &str, reason: &str) -> ReconnectOutcome {
        self.push.leave(session_id);
        self.store.report_auth_failure(session_id, reason);
        ReconnectOutcome::Abandoned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GenerationSession, Snapshot, SnapshotOrigin};
    use crate::store::StoreEvent;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingPush {
        calls: Mutex<Vec<String>>,
    }

    impl PushChannel for RecordingPush {
        fn join(&self, session_id: &str) {
            self.calls.lock().push(format!("join:{session_id}"));
        }

        fn leave(&self, session_id: &str) {
            self.calls.lock().push(format!("leave:{session_id}"));
        }
    }

    #[derive(Default)]
    struct MockPoll {
        responses: Mutex<VecDeque<SyncResult<Snapshot>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PollChannel for MockPoll {
        async fn fetch_snapshot(&self, session_id: &str) -> SyncResult<Snapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().pop_front();
            next.unwrap_or_else(|| Ok(Snapshot::new(session_id, SnapshotOrigin::Poll)))
        }
    }

    fn setup(
        session: GenerationSession,
    ) -> (Arc<SessionStore>, Arc<RecordingPush>, Arc<MockPoll>, ReconnectionManager) {
        let store = Arc::new(SessionStore::new());
        store.set(session);
        let push = Arc::new(RecordingPush::default());
        let poll = Arc::new(MockPoll::default());
        let manager = ReconnectionManager::new(
            Arc::clone(&store),
            push.clone(),
            poll.clone(),
            Reconciler::default(),
        );
        (store, push, poll, manager)
    }

    fn session(status: SessionStatus, initial_fetch_done: bool) -> GenerationSession {
        let mut session = GenerationSession::new("s1");
        session.status = status;
        session.initial_fetch_done = initial_fetch_done;
        session
    }

    #[test_timeout::tokio_timeout_test]
    async fn nothing_to_do_without_an_active_session() {
        let (_store, push, poll, manager) = setup(session(SessionStatus::Processing, true));
        assert_eq!(manager.on_connected(None).await.unwrap(), ReconnectOutcome::Idle);
        assert!(push.calls.lock().is_empty());
        assert_eq!(poll.calls.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn mid_epoch_reconnect_fetches_once() {
        let (store, push, poll, manager) = setup(session(SessionStatus::Processing, true));
        let mut snapshot = Snapshot::new("s1", SnapshotOrigin::Poll);
        snapshot.status = Some(SessionStatus::Failed);
        poll.responses.lock().push_back(Ok(snapshot));

        let outcome = manager.on_connected(Some("s1")).await.unwrap();
        assert_eq!(outcome, ReconnectOutcome::Rejoined { resynced: true });
        assert_eq!(push.calls.lock().clone(), vec!["join:s1".to_string()]);
        assert_eq!(poll.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("s1").unwrap().status, SessionStatus::Failed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn settled_session_only_rejoins() {
        let (_store, push, poll, manager) = setup(session(SessionStatus::Completed, true));

        let outcome = manager.on_connected(Some("s1")).await.unwrap();
        assert_eq!(outcome, ReconnectOutcome::Rejoined { resynced: false });
        assert_eq!(push.calls.lock().len(), 1);
        assert_eq!(poll.calls.load(Ordering::SeqCst), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_history_is_fetched_and_marked_done() {
        let (store, _push, poll, manager) = setup(session(SessionStatus::Checking, false));

        manager.on_connected(Some("s1")).await.unwrap();
        let session = store.get("s1").unwrap();
        assert!(session.initial_fetch_done);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(poll.calls.load(Ordering::SeqCst), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn auth_failure_abandons_the_session() {
        let (store, push, poll, manager) = setup(session(SessionStatus::Processing, true));
        let mut events = store.subscribe();
        poll.responses
            .lock()
            .push_back(Err(SyncError::Auth("revoked".into())));

        let outcome = manager.on_connected(Some("s1")).await.unwrap();
        assert_eq!(outcome, ReconnectOutcome::Abandoned);
        assert_eq!(
            push.calls.lock().clone(),
            vec!["join:s1".to_string(), "leave:s1".to_string()]
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            StoreEvent::AuthRejected { .. }
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn transient_resync_failure_is_returned() {
        let (store, _push, poll, manager) = setup(session(SessionStatus::Processing, true));
        poll.responses
            .lock()
            .push_back(Err(SyncError::Transport("refused".into())));

        let err = manager.on_connected(Some("s1")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get("s1").unwrap().status, SessionStatus::Processing);
    }
}
