//! Producers of [`ChannelEvent`](crate::model::ChannelEvent)s. Nothing in here touches session
//! state; adapters only fetch, decode and stamp.

pub mod command;
pub mod http;
pub mod poll;
pub mod push;
pub mod stream;

pub use command::{ByteStream, CommandMode, CommandTransport, HttpCommandTransport};
pub use http::ApiEndpoint;
pub use poll::{HttpPollChannel, PollChannel};
pub use push::{OfflinePush, PushChannel, PushEvent, PushSettings, WsPushChannel};
pub use stream::{StreamDecoder, StreamRecord};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

/// Decodes each record on its own so one malformed entry does not cost the whole snapshot.
pub(crate) fn decode_records<T: DeserializeOwned>(
    raw: Vec<Value>,
    session_id: &str,
    kind: &'static str,
) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(
                    target = "genboard::channel",
                    session_id,
                    kind,
                    error = %err,
                    "skipping malformed record"
                );
                None
            }
        })
        .collect()
}
