use reqwest::StatusCode;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("prompt rejected: {0}")]
    Validation(String),
    #[error("generation failed: {0}")]
    Backend(String),
    #[error("malformed payload: {0}")]
    Decode(String),
    #[error("a command is already in flight for session {0}")]
    CommandInFlight(String),
    #[error("no session is open")]
    NoActiveSession,
}

impl SyncError {
    /// Only an auth rejection ends the session; everything else is retried or surfaced as a warning.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Network(_)
                | SyncError::HttpStatus(_)
                | SyncError::Decode(_)
        )
    }

    pub(crate) fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let reason = if body.trim().is_empty() {
                status.to_string()
            } else {
                body.trim().to_string()
            };
            SyncError::Auth(reason)
        } else {
            SyncError::HttpStatus(status)
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Decode(err.to_string())
    }
}
