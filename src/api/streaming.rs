//! Audit reconstruction of Server-Sent Events (SSE) responses.
//!
//! The client receives the upstream bytes untouched. For the audit record,
//! the buffered chunks are folded back into a single JSON document holding
//! the completion metadata, the concatenated content and the usage block.

use crate::core::decoder;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

/// Identifying fields frozen from the first frame that carries any of them.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct StreamMetadata {
    pub id: String,
    pub model: String,
    pub system_fingerprint: String,
    pub created: i64,
}

/// Logical body stored in place of the raw event stream.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ReconstructedBody {
    pub metadata: StreamMetadata,
    pub content: String,
    pub usage: Option<Value>,
    pub total_chunks: usize,
}

/// Whether a `Content-Type` value denotes an event stream.
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

/// Build the audit body for a streamed response.
///
/// `chunks` are the read units as received, still encoded per `encoding`.
/// Falls back to the raw concatenation when the bytes cannot be decoded or
/// no frame carries a JSON object.
pub fn reconstruct_stream_body(chunks: &[Bytes], encoding: &str) -> String {
    let raw = chunks.concat();

    let decoded = match decoder::decode(&raw, encoding) {
        Ok(decoded) => decoded,
        Err(e) => {
            tracing::warn!("Could not decode streamed response for audit: {}", e);
            return String::from_utf8_lossy(&raw).into_owned();
        }
    };

    let text = String::from_utf8_lossy(&decoded);
    match fold_frames(&text, chunks.len()) {
        Some(body) => serde_json::to_string_pretty(&body)
            .unwrap_or_else(|_| String::from_utf8_lossy(&raw).into_owned()),
        None => String::from_utf8_lossy(&raw).into_owned(),
    }
}

/// Fold `data:` frames in arrival order. `None` if no frame was a JSON object.
fn fold_frames(text: &str, total_chunks: usize) -> Option<ReconstructedBody> {
    let mut body = ReconstructedBody {
        total_chunks,
        ..Default::default()
    };
    let mut metadata_frozen = false;
    let mut saw_frame = false;

    for line in text.lines() {
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let payload = payload.trim();
        if payload == DONE_MARKER {
            break;
        }

        let Ok(Value::Object(frame)) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        saw_frame = true;

        if !metadata_frozen {
            metadata_frozen = freeze_metadata(&mut body.metadata, &frame);
        }

        if let Some(fragment) = frame
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            body.content.push_str(fragment);
        }

        if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
            body.usage = Some(usage.clone());
        }
    }

    saw_frame.then_some(body)
}

/// Copy identifying fields from `frame`; returns whether any were present.
fn freeze_metadata(metadata: &mut StreamMetadata, frame: &serde_json::Map<String, Value>) -> bool {
    let mut found = false;

    if let Some(id) = frame.get("id").and_then(Value::as_str) {
        metadata.id = id.to_string();
        found = true;
    }
    if let Some(model) = frame.get("model").and_then(Value::as_str) {
        metadata.model = model.to_string();
        found = true;
    }
    if let Some(fp) = frame.get("system_fingerprint").and_then(Value::as_str) {
        metadata.system_fingerprint = fp.to_string();
        found = true;
    }
    if let Some(created) = frame.get("created").and_then(Value::as_f64) {
        metadata.created = created as i64;
        found = true;
    }

    found
}
