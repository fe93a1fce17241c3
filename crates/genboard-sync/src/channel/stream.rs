//! Incremental decoder for newline-delimited JSON command responses.

use crate::error::{SyncError, SyncResult};
use crate::model::{timestamp, Artifact, StreamChunk, StreamResult};
use bytes::BytesMut;
use chrono::Utc;
use serde_json::Value;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Chunk(StreamChunk),
    Result(StreamResult),
    /// The backend refused the prompt. Recoverable.
    Rejected { step: String, reason: String },
    /// The backend gave up on the job.
    Failed { reason: String },
}

impl StreamRecord {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamRecord::Chunk(_))
    }
}

pub struct StreamDecoder {
    session_id: String,
    buffer: BytesMut,
    sequence: u64,
}

impl StreamDecoder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: BytesMut::new(),
            sequence: 0,
        }
    }

    /// Feeds one read's worth of bytes. Returns a record per complete line; an incomplete
    /// trailing line stays buffered for the next read.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SyncResult<StreamRecord>> {
        self.buffer.extend_from_slice(bytes);
        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            if let Some(record) = self.decode_line(&line) {
                records.push(record);
            }
        }
        records
    }

    /// Flushes whatever is left once the body has ended without a final newline.
    pub fn finish(&mut self) -> Option<SyncResult<StreamRecord>> {
        let rest = self.buffer.split();
        self.decode_line(&rest)
    }

    pub fn has_buffered(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<SyncResult<StreamRecord>> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(err) => return Some(Err(SyncError::Decode(format!("stream line is not utf-8: {err}")))),
        };
        if text.is_empty() {
            return None;
        }
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(err) => return Some(Err(err.into())),
        };
        trace!(target = "genboard::stream", session_id = %self.session_id, line = text, "record");
        Some(self.classify(value))
    }

    fn classify(&mut self, value: Value) -> SyncResult<StreamRecord> {
        let Value::Object(mut record) = value else {
            return Err(SyncError::Decode("stream record is not an object".into()));
        };
        let step = record
            .get("step")
            .and_then(Value::as_str)
            .map(str::to_string);

        if let Some(Value::Object(mut response)) = record.remove("response") {
            let conversation_id = record
                .get("conversationId")
                .or_else(|| record.get("conversation_id"))
                .and_then(|id| match id {
                    Value::String(id) => Some(id.clone()),
                    Value::Number(id) => Some(id.to_string()),
                    _ => None,
                });
            let rows = match response.remove("rows") {
                Some(Value::Array(rows)) => rows.into_iter().map(Artifact).collect(),
                _ => Vec::new(),
            };
            let columns = match response.remove("columns") {
                Some(Value::Array(columns)) => columns,
                _ => Vec::new(),
            };
            return Ok(StreamRecord::Result(StreamResult {
                session_id: self.session_id.clone(),
                conversation_id,
                rows,
                columns,
                metadata: response.remove("metadata").filter(|meta| !meta.is_null()),
            }));
        }

        if let Some(error) = record.get("error").filter(|error| !error.is_null()) {
            let reason = describe(error);
            let is_validation = step.as_deref() == Some("validation")
                || record.get("kind").and_then(Value::as_str) == Some("validation");
            return Ok(if is_validation {
                StreamRecord::Rejected {
                    step: step.unwrap_or_else(|| "validation".to_string()),
                    reason,
                }
            } else {
                StreamRecord::Failed { reason }
            });
        }

        let Some(step) = step else {
            return Err(SyncError::Decode(
                "stream record has neither a step nor a response".into(),
            ));
        };
        let payload = record
            .remove("data")
            .or_else(|| record.remove("content"))
            .unwrap_or(Value::Null);

        if step == "validation" && payload.get("valid").and_then(Value::as_bool) == Some(false) {
            let reason = payload
                .get("message")
                .or_else(|| payload.get("reason"))
                .map(describe)
                .unwrap_or_else(|| "prompt did not pass validation".to_string());
            return Ok(StreamRecord::Rejected { step, reason });
        }

        let timestamp = record
            .get("timestamp")
            .and_then(timestamp::from_value)
            .unwrap_or_else(Utc::now);
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(StreamRecord::Chunk(StreamChunk {
            session_id: self.session_id.clone(),
            sequence,
            step,
            payload,
            timestamp,
        }))
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("detail"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}
