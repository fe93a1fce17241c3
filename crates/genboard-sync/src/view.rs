//! The displayed session and its lifecycle: open, send, cancel, close.
//!
//! A view owns exactly one active session id at a time. Switching sessions tears the previous
//! one down the same way navigating away does: the reader is released, polling stops and the
//! push room is left, but the stored state is kept.

use crate::channel::command::{CommandMode, CommandTransport};
use crate::channel::poll::PollChannel;
use crate::channel::push::{PushChannel, PushEvent};
use crate::config::SyncTimings;
use crate::dispatcher::{CommandDispatcher, CommandReceipt};
use crate::error::{SyncError, SyncResult};
use crate::model::GenerationSession;
use crate::reconciler::Reconciler;
use crate::reconnect::{ReconnectOutcome, ReconnectionManager};
use crate::scheduler::PollScheduler;
use crate::store::{SessionStore, StoreEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewExit {
    Closed,
    Abandoned { session_id: String, reason: String },
}

pub struct SessionView {
    store: Arc<SessionStore>,
    dispatcher: Arc<CommandDispatcher>,
    scheduler: Arc<PollScheduler>,
    reconnection: ReconnectionManager,
    push: Arc<dyn PushChannel>,
    poll: Arc<dyn PollChannel>,
    reconciler: Reconciler,
    active: Mutex<Option<String>>,
}

impl SessionView {
    pub fn new(
        store: Arc<SessionStore>,
        push: Arc<dyn PushChannel>,
        poll: Arc<dyn PollChannel>,
        transport: Arc<dyn CommandTransport>,
        timings: &SyncTimings,
    ) -> Self {
        let reconciler = Reconciler::new(timings.dedup_window);
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&store),
            transport,
            reconciler,
            timings.ack_timeout,
        ));
        let scheduler = Arc::new(PollScheduler::new(
            Arc::clone(&store),
            Arc::clone(&poll),
            reconciler,
            timings.poll_interval,
        ));
        let reconnection = ReconnectionManager::new(
            Arc::clone(&store),
            Arc::clone(&push),
            Arc::clone(&poll),
            reconciler,
        );
        Self {
            store,
            dispatcher,
            scheduler,
            reconnection,
            push,
            poll,
            reconciler,
            active: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn active_session(&self) -> Option<String> {
        self.active.lock().clone()
    }

    pub fn current(&self) -> Option<GenerationSession> {
        self.active_session().and_then(|id| self.store.get(&id))
    }

    pub fn is_streaming(&self) -> bool {
        self.active_session()
            .is_some_and(|id| self.dispatcher.is_streaming(&id))
    }

    pub fn is_polling(&self) -> bool {
        self.active_session()
            .is_some_and(|id| self.scheduler.is_polling(&id))
    }

    /// Displays `session_id`: fresh state, push room joined, history loaded once. Polling
    /// resumes on its own when the history shows an unfinished job.
    pub async fn open(&self, session_id: &str) -> SyncResult<GenerationSession> {
        self.close();
        *self.active.lock() = Some(session_id.to_string());

        self.store.reset(session_id);
        self.store
            .update(session_id, |s| self.reconciler.begin_initial_fetch(s, Utc::now()));
        self.push.join(session_id);
        info!(target = "genboard::view", session_id, "session opened");

        match self.poll.fetch_snapshot(session_id).await {
            Ok(snapshot) => {
                self.store.update(session_id, |s| {
                    self.reconciler
                        .complete_initial_fetch(s, Some(&snapshot), Utc::now())
                });
            }
            Err(SyncError::Auth(reason)) => {
                self.reconnection.on_auth_error(session_id, &reason);
                self.close();
                return Err(SyncError::Auth(reason));
            }
            Err(err) => {
                warn!(
                    target = "genboard::view",
                    session_id,
                    error = %err,
                    "could not load history"
                );
                self.store.update(session_id, |s| {
                    self.reconciler.abort_initial_fetch(
                        s,
                        format!("could not load history: {err}"),
                        Utc::now(),
                    )
                });
            }
        }

        self.scheduler.watch(session_id);
        self.store
            .get(session_id)
            .ok_or(SyncError::NoActiveSession)
    }

    /// Navigation teardown. A running job is left alone server-side and the stored state
    /// is kept for when the session is reopened.
    pub fn close(&self) -> Option<String> {
        let session_id = self.active.lock().take()?;
        self.dispatcher.detach(&session_id);
        self.scheduler.unwatch(&session_id);
        self.push.leave(&session_id);
        debug!(target = "genboard::view", session_id = %session_id, "session closed");
        Some(session_id)
    }

    pub async fn send(&self, content: &str, mode: CommandMode) -> SyncResult<CommandReceipt> {
        let session_id = self.active_session().ok_or(SyncError::NoActiveSession)?;
        // A cancel leaves the room; a new command needs it again.
        self.push.join(&session_id);
        self.dispatcher.send(&session_id, content, mode).await
    }

    pub fn cancel(&self) -> SyncResult<GenerationSession> {
        let session_id = self.active_session().ok_or(SyncError::NoActiveSession)?;
        let session = self.dispatcher.cancel(&session_id);
        self.scheduler.stop(&session_id);
        self.push.leave(&session_id);
        session.ok_or(SyncError::NoActiveSession)
    }

    pub fn dismiss_warning(&self) -> Option<GenerationSession> {
        let session_id = self.active_session()?;
        self.store
            .update(&session_id, |s| self.reconciler.dismiss_warning(s, Utc::now()))
    }

    /// Routes one push event. Returns an exit when the session has to be abandoned.
    pub async fn handle_push(&self, event: PushEvent) -> Option<ViewExit> {
        let active = self.active_session();
        match event {
            PushEvent::Connected => match self.reconnection.on_connected(active.as_deref()).await {
                Ok(ReconnectOutcome::Abandoned) => active.map(|session_id| ViewExit::Abandoned {
                    session_id,
                    reason: "credentials rejected while resyncing".to_string(),
                }),
                Ok(_) => None,
                Err(err) => {
                    debug!(target = "genboard::view", error = %err, "resync deferred to polling");
                    None
                }
            },
            PushEvent::Disconnected { reason } => {
                self.reconnection.on_disconnected(active.as_deref(), &reason);
                None
            }
            PushEvent::Update(snapshot) => {
                match active {
                    Some(id) if id == snapshot.session_id => {
                        self.store
                            .update(&id, |s| self.reconciler.merge_snapshot(s, &snapshot));
                    }
                    _ => debug!(
                        target = "genboard::view",
                        session_id = %snapshot.session_id,
                        "update for a session that is not displayed"
                    ),
                }
                None
            }
            PushEvent::AuthError(reason) => {
                let session_id = active?;
                self.reconnection.on_auth_error(&session_id, &reason);
                Some(ViewExit::Abandoned { session_id, reason })
            }
        }
    }

    /// Drives the view until `shutdown` fires or the session has to be abandoned. Either
    /// way the view is closed on return.
    pub async fn run(
        &self,
        mut push_events: mpsc::UnboundedReceiver<PushEvent>,
        shutdown: CancellationToken,
    ) -> ViewExit {
        let mut store_events = self.store.subscribe();
        let mut push_open = true;

        let exit = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break ViewExit::Closed,
                event = push_events.recv(), if push_open => match event {
                    Some(event) => {
                        if let Some(exit) = self.handle_push(event).await {
                            break exit;
                        }
                    }
                    None => {
                        debug!(target = "genboard::view", "push channel closed, polling only");
                        push_open = false;
                    }
                },
                event = store_events.recv() => match event {
                    Ok(StoreEvent::AuthRejected { session_id, reason })
                        if self.active_session().as_deref() == Some(session_id.as_str()) =>
                    {
                        break ViewExit::Abandoned { session_id, reason };
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break ViewExit::Closed,
                },
            }
        };

        if let ViewExit::Abandoned { session_id, reason } = &exit {
            warn!(target = "genboard::view", session_id = %session_id, reason = %reason, "session abandoned");
        }
        self.close();
        exit
    }
}
