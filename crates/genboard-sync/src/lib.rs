//! Client-side synchronizer for generation sessions.
//!
//! Three transports report on the same job: a push channel, a poll endpoint and the body of
//! a streamed command. They race, overlap and drop out. Everything they deliver is folded
//! through one [`Reconciler`] into a [`SessionStore`], so the status, log timeline and
//! artifact set a view renders never depend on which transport won.

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod reconnect;
pub mod scheduler;
pub mod store;
pub mod view;

pub use channel::{
    ApiEndpoint, CommandMode, CommandTransport, HttpCommandTransport, HttpPollChannel,
    OfflinePush, PollChannel, PushChannel, PushEvent, PushSettings, WsPushChannel,
};
pub use config::{SyncConfig, SyncTimings};
pub use dispatcher::{AbortReason, CommandDispatcher, CommandReceipt};
pub use error::{SyncError, SyncResult};
pub use model::{
    Artifact, ChannelEvent, GenerationSession, LogEntry, LogRole, OptimisticEcho,
    SessionStatus, Snapshot, SnapshotOrigin, StreamChunk, StreamResult,
};
pub use reconciler::Reconciler;
pub use reconnect::{ReconnectOutcome, ReconnectionManager};
pub use scheduler::{should_poll, PollScheduler};
pub use store::{SessionStore, StoreEvent};
pub use view::{SessionView, ViewExit};
