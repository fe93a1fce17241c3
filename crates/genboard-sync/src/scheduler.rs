use crate::channel::poll::PollChannel;
use crate::error::SyncError;
use crate::model::{GenerationSession, SessionStatus};
use crate::reconciler::Reconciler;
use crate::store::{SessionStore, StoreEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Polling runs only mid-epoch and only once the ack window has closed.
pub fn should_poll(session: &GenerationSession) -> bool {
    session.status == SessionStatus::Processing && !session.ack_pending
}

struct Poller {
    generation: u64,
    cancel: CancellationToken,
}

/// Owns at most one recurring fetch per session and starts or stops it as the session
/// changes.
pub struct PollScheduler {
    store: Arc<SessionStore>,
    channel: Arc<dyn PollChannel>,
    reconciler: Reconciler,
    interval: Duration,
    pollers: Mutex<HashMap<String, Poller>>,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    next_generation: AtomicU64,
}

impl PollScheduler {
    pub fn new(
        store: Arc<SessionStore>,
        channel: Arc<dyn PollChannel>,
        reconciler: Reconciler,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            reconciler,
            interval,
            pollers: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn is_polling(&self, session_id: &str) -> bool {
        self.pollers.lock().contains_key(session_id)
    }

    pub fn evaluate(self: &Arc<Self>, session_id: &str) {
        match self.store.get(session_id) {
            Some(session) if should_poll(&session) => {
                self.start(session_id);
            }
            _ => self.stop(session_id),
        }
    }

    /// Re-evaluates on every store change for `session_id` until [`unwatch`](Self::unwatch).
    pub fn watch(self: &Arc<Self>, session_id: &str) {
        let events = self.store.subscribe();
        let scheduler = Arc::clone(self);
        let id = session_id.to_string();
        let watcher = tokio::spawn(async move { scheduler.follow(id, events).await });
        if let Some(previous) = self.watchers.lock().insert(session_id.to_string(), watcher) {
            previous.abort();
        }
        self.evaluate(session_id);
    }

    pub fn unwatch(&self, session_id: &str) {
        if let Some(watcher) = self.watchers.lock().remove(session_id) {
            watcher.abort();
        }
        self.stop(session_id);
    }

    pub fn stop(&self, session_id: &str) {
        let poller = self.pollers.lock().remove(session_id);
        if let Some(poller) = poller {
            poller.cancel.cancel();
            debug!(target = "genboard::scheduler", session_id, "polling stopped");
        }
    }

    fn start(self: &Arc<Self>, session_id: &str) -> bool {
        let mut pollers = self.pollers.lock();
        if pollers.contains_key(session_id) {
            return false;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        pollers.insert(
            session_id.to_string(),
            Poller {
                generation,
                cancel: cancel.clone(),
            },
        );
        drop(pollers);

        debug!(
            target = "genboard::scheduler",
            session_id,
            interval_ms = self.interval.as_millis() as u64,
            "polling started"
        );
        let scheduler = Arc::clone(self);
        let id = session_id.to_string();
        tokio::spawn(async move { scheduler.poll_loop(id, generation, cancel).await });
        true
    }

    async fn follow(self: Arc<Self>, session_id: String, mut events: broadcast::Receiver<StoreEvent>) {
        loop {
            match events.recv().await {
                Ok(StoreEvent::Removed(id)) if id == session_id => {
                    self.stop(&session_id);
                    break;
                }
                Ok(StoreEvent::Updated(session)) if session.session_id == session_id => {
                    self.evaluate(&session_id)
                }
                Ok(StoreEvent::Reset(id)) if id == session_id => self.evaluate(&session_id),
                // Auth rejections are handled by whoever owns the view.
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => self.evaluate(&session_id),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, session_id: String, generation: u64, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.store.get(&session_id).is_some_and(|s| should_poll(&s)) {
                break;
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.channel.fetch_snapshot(&session_id) => fetched,
            };
            match fetched {
                Ok(snapshot) => {
                    debug!(target = "genboard::scheduler", session_id = %session_id, "poll tick merged");
                    self.store
                        .update(&session_id, |s| self.reconciler.merge_snapshot(s, &snapshot));
                }
                Err(SyncError::Auth(reason)) => {
                    self.store.report_auth_failure(&session_id, reason);
                    break;
                }
                Err(err) => {
                    warn!(
                        target = "genboard::scheduler",
                        session_id = %session_id,
                        error = %err,
                        "poll failed, retrying next tick"
                    );
                }
            }
        }

        let mut pollers = self.pollers.lock();
        if pollers
            .get(&session_id)
            .is_some_and(|poller| poller.generation == generation)
        {
            pollers.remove(&session_id);
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.abort();
        }
        for (_, poller) in self.pollers.lock().drain() {
            poller.cancel.cancel();
        }
    }
}
