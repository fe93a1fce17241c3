//! Sends user commands and owns everything a command leaves running: the ack deadline timer
//! and, for streamed commands, the single reader draining the response body.

use crate::channel::command::{ByteStream, CommandMode, CommandTransport};
use crate::channel::stream::{StreamDecoder, StreamRecord};
use crate::error::{SyncError, SyncResult};
use crate::model::{GenerationSession, OptimisticEcho, SessionStatus};
use crate::reconciler::Reconciler;
use crate::store::SessionStore;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The user stopped the job. The session ends `Cancelled`.
    UserCancel,
    /// The view went away. The job keeps running server-side and status is left alone.
    Navigation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReceipt {
    pub session_id: String,
    pub temp_id: String,
    pub epoch: u64,
    pub mode: CommandMode,
}

struct InFlight {
    epoch: u64,
    cancel: CancellationToken,
    /// Written immediately before `cancel` fires so the reader can tell why it stopped.
    abort: Arc<Mutex<Option<AbortReason>>>,
    reader: Option<JoinHandle<()>>,
}

/// Everything the stream reader needs to undo or finish its epoch.
struct EpochContext {
    session_id: String,
    epoch: u64,
    temp_id: String,
    prior_status: SessionStatus,
}

enum ReaderExit {
    Finished,
    Aborted,
    TransportLost(SyncError),
    Exhausted,
}

pub struct CommandDispatcher {
    store: Arc<SessionStore>,
    transport: Arc<dyn CommandTransport>,
    reconciler: Reconciler,
    ack_timeout: Duration,
    in_flight: Mutex<HashMap<String, InFlight>>,
    ack_timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        transport: Arc<dyn CommandTransport>,
        reconciler: Reconciler,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            reconciler,
            ack_timeout,
            in_flight: Mutex::new(HashMap::new()),
            ack_timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.in_flight.lock().contains_key(session_id)
    }

    /// Shows the command immediately, opens a new epoch and transmits it.
    ///
    /// Fire-and-forget commands resolve once the backend acknowledged the request. Streamed
    /// commands resolve once the response started; a background reader feeds the rest of the
    /// body into the store.
    pub async fn send(
        self: &Arc<Self>,
        session_id: &str,
        content: &str,
        mode: CommandMode,
    ) -> SyncResult<CommandReceipt> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("command is empty".into()));
        }

        let cancel = CancellationToken::new();
        let abort = Arc::new(Mutex::new(None));
        let echo = OptimisticEcho::new(content, Utc::now());
        let context = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(session_id) {
                return Err(SyncError::CommandInFlight(session_id.to_string()));
            }
            let prior = self.store.get(session_id).ok_or(SyncError::NoActiveSession)?;
            let deadline = echo.timestamp
                + chrono::Duration::from_std(self.ack_timeout).unwrap_or(chrono::Duration::zero());
            let started = self
                .store
                .update(session_id, |s| self.reconciler.begin_epoch(s, &echo, deadline))
                .ok_or(SyncError::NoActiveSession)?;
            in_flight.insert(
                session_id.to_string(),
                InFlight {
                    epoch: started.epoch,
                    cancel: cancel.clone(),
                    abort: Arc::clone(&abort),
                    reader: None,
                },
            );
            EpochContext {
                session_id: session_id.to_string(),
                epoch: started.epoch,
                temp_id: echo.temp_id.clone(),
                prior_status: prior.status,
            }
        };
        info!(
            target = "genboard::dispatcher",
            session_id,
            epoch = context.epoch,
            mode = ?mode,
            "command sent"
        );
        self.arm_ack_timer(session_id, context.epoch);

        let receipt = CommandReceipt {
            session_id: session_id.to_string(),
            temp_id: context.temp_id.clone(),
            epoch: context.epoch,
            mode,
        };

        match mode {
            CommandMode::FireAndForget => {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = self.transport.post_message(session_id, content) => Some(result),
                };
                self.release(session_id, context.epoch);
                match outcome {
                    None => Ok(receipt),
                    Some(Ok(())) => {
                        self.stop_ack_timer(session_id);
                        self.store.update(session_id, |s| {
                            self.reconciler.acknowledge(s, context.epoch, Utc::now())
                        });
                        Ok(receipt)
                    }
                    Some(Err(err)) => Err(self.fail_before_ack(&context, err)),
                }
            }
            CommandMode::Streamed => {
                let opened = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = self.transport.start_generation(session_id, content) => Some(result),
                };
                match opened {
                    None => {
                        self.release(session_id, context.epoch);
                        Ok(receipt)
                    }
                    Some(Err(err)) => {
                        self.release(session_id, context.epoch);
                        Err(self.fail_before_ack(&context, err))
                    }
                    Some(Ok(body)) => {
                        let dispatcher = Arc::clone(self);
                        let epoch = context.epoch;
                        let reader = tokio::spawn(async move {
                            dispatcher.read_stream(context, body, cancel, abort).await;
                        });
                        if let Some(entry) = self.in_flight.lock().get_mut(session_id) {
                            if entry.epoch == epoch {
                                entry.reader = Some(reader);
                            }
                        }
                        Ok(receipt)
                    }
                }
            }
        }
    }

    /// Explicit stop. Aborts the request or reader and ends the epoch as `Cancelled`.
    /// Calling it again, or with nothing in flight, is harmless.
    pub fn cancel(&self, session_id: &str) -> Option<GenerationSession> {
        self.abort_in_flight(session_id, AbortReason::UserCancel);
        self.stop_ack_timer(session_id);
        let next = self
            .store
            .update(session_id, |s| self.reconciler.cancel_epoch(s, Utc::now()));
        info!(target = "genboard::dispatcher", session_id, "command cancelled");
        next
    }

    /// Releases the local reader without touching session state. The job continues
    /// server-side and polling picks it up again when the session is reopened.
    pub fn detach(&self, session_id: &str) {
        if self.abort_in_flight(session_id, AbortReason::Navigation) {
            debug!(target = "genboard::dispatcher", session_id, "reader detached");
        }
        self.stop_ack_timer(session_id);
    }

    fn abort_in_flight(&self, session_id: &str, reason: AbortReason) -> bool {
        let entry = self.in_flight.lock().remove(session_id);
        match entry {
            Some(entry) => {
                *entry.abort.lock() = Some(reason);
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, session_id: &str, epoch: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(session_id).is_some_and(|entry| entry.epoch == epoch) {
            in_flight.remove(session_id);
        }
    }

    fn arm_ack_timer(self: &Arc<Self>, session_id: &str, epoch: u64) {
        let dispatcher = Arc::clone(self);
        let id = session_id.to_string();
        let timeout = self.ack_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            dispatcher
                .store
                .update(&id, |s| dispatcher.reconciler.expire_ack(s, epoch, Utc::now()));
        });
        if let Some(previous) = self.ack_timers.lock().insert(session_id.to_string(), timer) {
            previous.abort();
        }
    }

    fn stop_ack_timer(&self, session_id: &str) {
        if let Some(timer) = self.ack_timers.lock().remove(session_id) {
            timer.abort();
        }
    }

    fn fail_before_ack(&self, context: &EpochContext, err: SyncError) -> SyncError {
        self.stop_ack_timer(&context.session_id);
        warn!(
            target = "genboard::dispatcher",
            session_id = %context.session_id,
            epoch = context.epoch,
            error = %err,
            "command not delivered, rolling back"
        );
        self.store.update(&context.session_id, |s| {
            self.reconciler.rollback_command(
                s,
                context.epoch,
                &context.temp_id,
                context.prior_status,
                format!("could not send command: {err}"),
                Utc::now(),
            )
        });
        if let SyncError::Auth(reason) = &err {
            self.store.report_auth_failure(&context.session_id, reason.clone());
        }
        err
    }

    /// Applies `transition` only while the session is still on `epoch`.
    fn update_epoch<F>(&self, session_id: &str, epoch: u64, transition: F)
    where
        F: FnOnce(&GenerationSession) -> GenerationSession,
    {
        self.store.update(session_id, |s| {
            if s.epoch == epoch {
                transition(s)
            } else {
                s.clone()
            }
        });
    }

    async fn read_stream(
        self: Arc<Self>,
        context: EpochContext,
        mut body: ByteStream,
        cancel: CancellationToken,
        abort: Arc<Mutex<Option<AbortReason>>>,
    ) {
        let mut decoder = StreamDecoder::new(context.session_id.clone());
        let mut acked = false;

        let exit = 'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'read ReaderExit::Aborted,
                next = body.next() => next,
            };
            match next {
                Some(Ok(bytes)) => {
                    for record in decoder.push(&bytes) {
                        if cancel.is_cancelled() {
                            break 'read ReaderExit::Aborted;
                        }
                        if let Some(exit) = self.handle_record(&context, record, &mut acked) {
                            break 'read exit;
                        }
                    }
                }
                Some(Err(err)) => break 'read ReaderExit::TransportLost(err),
                None => {
                    if let Some(record) = decoder.finish() {
                        if let Some(exit) = self.handle_record(&context, record, &mut acked) {
                            break 'read exit;
                        }
                    }
                    break 'read ReaderExit::Exhausted;
                }
            }
        };
        drop(body);
        self.release(&context.session_id, context.epoch);

        let session_id = context.session_id.as_str();
        match exit {
            ReaderExit::Finished => {
                self.stop_ack_timer(session_id);
            }
            ReaderExit::Aborted => {
                let reason = abort.lock().take();
                match reason {
                    Some(AbortReason::Navigation) => info!(
                        target = "genboard::dispatcher",
                        session_id,
                        epoch = context.epoch,
                        "stream released, job continues server-side"
                    ),
                    _ => debug!(
                        target = "genboard::dispatcher",
                        session_id,
                        epoch = context.epoch,
                        "stream aborted by user"
                    ),
                }
            }
            ReaderExit::TransportLost(err) if !acked => {
                self.fail_before_ack(&context, err);
            }
            ReaderExit::TransportLost(err) => {
                warn!(
                    target = "genboard::dispatcher",
                    session_id,
                    epoch = context.epoch,
                    error = %err,
                    "stream lost mid-generation, following by polling"
                );
                self.update_epoch(session_id, context.epoch, |s| {
                    self.reconciler.warn(
                        s,
                        "lost the live stream; progress will update shortly",
                        Utc::now(),
                    )
                });
            }
            ReaderExit::Exhausted => {
                debug!(
                    target = "genboard::dispatcher",
                    session_id,
                    epoch = context.epoch,
                    "stream ended without a result"
                );
                self.stop_ack_timer(session_id);
                self.store.update(session_id, |s| {
                    self.reconciler.acknowledge(s, context.epoch, Utc::now())
                });
            }
        }
    }

    fn handle_record(
        &self,
        context: &EpochContext,
        record: SyncResult<StreamRecord>,
        acked: &mut bool,
    ) -> Option<ReaderExit> {
        let session_id = context.session_id.as_str();
        let epoch = context.epoch;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    target = "genboard::stream",
                    session_id,
                    error = %err,
                    "skipping undecodable stream record"
                );
                return None;
            }
        };
        if !*acked {
            *acked = true;
            self.stop_ack_timer(session_id);
        }

        match record {
            StreamRecord::Chunk(chunk) => {
                debug!(
                    target = "genboard::stream",
                    session_id,
                    step = %chunk.step,
                    sequence = chunk.sequence,
                    "chunk"
                );
                self.update_epoch(session_id, epoch, |s| self.reconciler.apply_chunk(s, &chunk));
                None
            }
            StreamRecord::Result(result) => {
                info!(
                    target = "genboard::stream",
                    session_id,
                    rows = result.rows.len(),
                    columns = result.columns.len(),
                    "generation finished"
                );
                self.update_epoch(session_id, epoch, |s| {
                    self.reconciler.apply_result(s, &result, Utc::now())
                });
                Some(ReaderExit::Finished)
            }
            StreamRecord::Rejected { step, reason } => {
                warn!(
                    target = "genboard::stream",
                    session_id,
                    step = %step,
                    reason = %reason,
                    "prompt rejected"
                );
                self.store.update(session_id, |s| {
                    self.reconciler
                        .reject_command(s, epoch, &context.temp_id, &reason, Utc::now())
                });
                Some(ReaderExit::Finished)
            }
            StreamRecord::Failed { reason } => {
                warn!(
                    target = "genboard::stream",
                    session_id,
                    reason = %reason,
                    "generation failed"
                );
                self.store.update(session_id, |s| {
                    self.reconciler.fail_epoch(s, epoch, &reason, Utc::now())
                });
                Some(ReaderExit::Finished)
            }
        }
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        for (_, timer) in self.ack_timers.lock().drain() {
            timer.abort();
        }
        for (_, entry) in self.in_flight.lock().drain() {
            entry.cancel.cancel();
            if let Some(reader) = entry.reader {
                reader.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogRole;
    use crate::store::StoreEvent;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct MockTransport {
        post_results: AsyncMutex<VecDeque<SyncResult<()>>>,
        streams: AsyncMutex<VecDeque<SyncResult<ByteStream>>>,
        posted: AsyncMutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        async fn queue_post(&self, result: SyncResult<()>) {
            self.post_results.lock().await.push_back(result);
        }

        async fn queue_stream(&self) -> UnboundedSender<SyncResult<Bytes>> {
            let (tx, rx) = unbounded();
            self.streams.lock().await.push_back(Ok(rx.boxed()));
            tx
        }
    }

    #[async_trait]
    impl CommandTransport for MockTransport {
        async fn post_message(&self, session_id: &str, query: &str) -> SyncResult<()> {
            self.posted
                .lock()
                .await
                .push((session_id.to_string(), query.to_string()));
            let next = self.post_results.lock().await.pop_front();
            match next {
                Some(result) => result,
                None => futures::future::pending().await,
            }
        }

        async fn start_generation(&self, _session_id: &str, _prompt: &str) -> SyncResult<ByteStream> {
            let next = self.streams.lock().await.pop_front();
            match next {
                Some(result) => result,
                None => futures::future::pending().await,
            }
        }
    }

    fn setup() -> (Arc<SessionStore>, Arc<MockTransport>, Arc<CommandDispatcher>) {
        let store = Arc::new(SessionStore::new());
        store.reset("s1");
        let transport = Arc::new(MockTransport::default());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&store),
            transport.clone(),
            Reconciler::default(),
            Duration::from_millis(5_000),
        ));
        (store, transport, dispatcher)
    }

    fn line(text: &str) -> SyncResult<Bytes> {
        Ok(Bytes::from(format!("{text}\n")))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn fire_and_forget_ack_clears_pending() {
        let (store, transport, dispatcher) = setup();
        transport.queue_post(Ok(())).await;

        let receipt = dispatcher
            .send("s1", " Make the headline punchier ", CommandMode::FireAndForget)
            .await
            .unwrap();

        let session = store.get("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(!session.ack_pending);
        assert_eq!(session.epoch, receipt.epoch);
        assert_eq!(session.logs.len(), 1);
        assert!(session.logs[0].is_optimistic);
        assert_eq!(session.logs[0].role, LogRole::User);
        assert_eq!(session.logs[0].content(), Some("Make the headline punchier"));
        assert_eq!(
            transport.posted.lock().await.clone(),
            vec![("s1".to_string(), "Make the headline punchier".to_string())]
        );
        assert!(!dispatcher.is_streaming("s1"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn delivery_failure_restores_prior_state() {
        let (store, transport, dispatcher) = setup();
        transport
            .queue_post(Err(SyncError::Transport("connection reset".into())))
            .await;

        let err = dispatcher
            .send("s1", "hello", CommandMode::FireAndForget)
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let session = store.get("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.logs.is_empty());
        assert!(!session.ack_pending);
        assert!(session.warning.is_some());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn rejected_credentials_are_reported() {
        let (store, transport, dispatcher) = setup();
        let mut events = store.subscribe();
        transport
            .queue_post(Err(SyncError::Auth("expired".into())))
            .await;

        let err = dispatcher
            .send("s1", "hello", CommandMode::FireAndForget)
            .await
            .unwrap_err();
        assert!(err.is_fatal());

        let mut saw_auth = false;
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::AuthRejected { session_id, reason } = event {
                assert_eq!(session_id, "s1");
                assert_eq!(reason, "expired");
                saw_auth = true;
            }
        }
        assert!(saw_auth);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn silent_transport_fails_open_after_deadline() {
        let (store, _transport, dispatcher) = setup();

        let pending = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                dispatcher
                    .send("s1", "hello", CommandMode::FireAndForget)
                    .await
            })
        };
        settle().await;
        assert!(store.get("s1").unwrap().ack_pending);

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(store.get("s1").unwrap().ack_pending);

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let session = store.get("s1").unwrap();
        assert!(!session.ack_pending);
        assert_eq!(session.status, SessionStatus::Processing);

        dispatcher.cancel("s1");
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(store.get("s1").unwrap().status, SessionStatus::Cancelled);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn second_command_waits_for_the_first() {
        let (_store, transport, dispatcher) = setup();
        let _body = transport.queue_stream().await;

        dispatcher
            .send("s1", "first", CommandMode::Streamed)
            .await
            .unwrap();
        let err = dispatcher
            .send("s1", "second", CommandMode::Streamed)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CommandInFlight(_)));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn first_chunk_acks_and_result_completes() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "Create a budget tracker", CommandMode::Streamed)
            .await
            .unwrap();
        assert!(dispatcher.is_streaming("s1"));
        assert!(store.get("s1").unwrap().ack_pending);

        body.unbounded_send(line(r#"{"step":"validation","data":{"valid":true}}"#))
            .unwrap();
        let acked = store.wait_for("s1", |s| !s.ack_pending).await.unwrap();
        assert_eq!(acked.status, SessionStatus::Processing);
        assert_eq!(acked.logs.len(), 2);

        body.unbounded_send(Ok(Bytes::from_static(
            br#"{"conversationId":"c1","response":{"rows":[{"a":1},{"a":2}],"columns":["a"]}}"#,
        )))
        .unwrap();
        drop(body);

        let done = store
            .wait_for("s1", |s| s.status == SessionStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.artifacts.len(), 2);
        assert_eq!(done.conversation_id.as_deref(), Some("c1"));
        settle().await;
        assert!(!dispatcher.is_streaming("s1"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn validation_rejection_returns_to_idle() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "asdf", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(line(
            r#"{"step":"validation","data":{"valid":false,"message":"not a spreadsheet request"}}"#,
        ))
        .unwrap();

        let session = store
            .wait_for("s1", |s| s.status == SessionStatus::Idle)
            .await
            .unwrap();
        assert!(session.logs.is_empty());
        assert!(!session.ack_pending);
        assert!(session
            .warning
            .as_deref()
            .is_some_and(|w| w.contains("not a spreadsheet request")));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn user_cancel_ends_the_epoch() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "deck please", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(line(r#"{"step":"planning","data":"outline"}"#))
            .unwrap();
        store.wait_for("s1", |s| !s.ack_pending).await.unwrap();

        dispatcher.cancel("s1");
        dispatcher.cancel("s1");
        let _ = body.unbounded_send(line(r#"{"step":"slides","data":"slide 1"}"#));
        settle().await;

        let session = store.get("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Cancelled);
        assert_eq!(session.logs.len(), 2);
        assert!(!dispatcher.is_streaming("s1"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn navigation_abort_leaves_status_alone() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "deck please", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(line(r#"{"step":"planning","data":"outline"}"#))
            .unwrap();
        store.wait_for("s1", |s| !s.ack_pending).await.unwrap();

        dispatcher.detach("s1");
        settle().await;

        let session = store.get("s1").unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(session.warning.is_none());
        assert!(!dispatcher.is_streaming("s1"));
        assert!(body.is_closed());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn lost_stream_before_ack_rolls_back() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "deck please", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(Err(SyncError::Transport("reset".into())))
            .unwrap();

        let session = store
            .wait_for("s1", |s| s.status == SessionStatus::Idle)
            .await
            .unwrap();
        assert!(session.logs.is_empty());
        assert!(session.warning.is_some());
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn lost_stream_after_ack_keeps_processing() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "deck please", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(line(r#"{"step":"planning","data":"outline"}"#))
            .unwrap();
        body.unbounded_send(Err(SyncError::Transport("reset".into())))
            .unwrap();

        let session = store
            .wait_for("s1", |s| s.warning.is_some())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Processing);
        assert!(!session.ack_pending);
        assert_eq!(session.logs.len(), 2);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn backend_failure_is_an_error_state() {
        let (store, transport, dispatcher) = setup();
        let body = transport.queue_stream().await;

        dispatcher
            .send("s1", "deck please", CommandMode::Streamed)
            .await
            .unwrap();
        body.unbounded_send(line(r#"{"step":"llm_processing","error":"model overloaded"}"#))
            .unwrap();

        let session = store
            .wait_for("s1", |s| s.status == SessionStatus::Error)
            .await
            .unwrap();
        assert_eq!(session.warning.as_deref(), Some("model overloaded"));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn empty_command_is_refused_before_anything_happens() {
        let (store, _transport, dispatcher) = setup();
        let err = dispatcher
            .send("s1", "   ", CommandMode::FireAndForget)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(store.get("s1").unwrap(), GenerationSession::new("s1"));
    }
}
