//! Replays recorded provider events (JSON Lines) through a demultiplexer.
//!
//! One record per line:
//!
//! ```text
//! {"id":"req-1","type":"content_delta","text":"<think>","raw":{...}}
//! {"id":"req-1","type":"tool_call_delta","index":0,"call_id":"call_1","name":"f","arguments":"{"}
//! {"id":"req-1","type":"completed","message":{"model":"m","finish_reason":"stop"}}
//! {"id":"req-2","type":"error","error":"connection reset","status":502}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Records without an
//! `id` form one stream under a generated id.

use std::io::BufRead;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::correlation::{CorrelationId, CorrelationIdGenerator};
use crate::error::StreamError;
use crate::stream::{
    AggregatedMessage, CompletedResponse, ContentDelta, FinishReason, PartialEvent,
    StreamDemultiplexer, StreamEvent, StreamHandler, TokenUsage,
};
use crate::tags::ClassificationState;
use crate::tool_call::{CompletedToolCall, PartialToolCall};

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read replay input: {0}")]
    Io(#[from] std::io::Error),
    #[error("Line {line}: invalid JSON record: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("Line {line}: missing required field '{field}'")]
    MissingField { line: usize, field: &'static str },
    #[error("Line {line}: unknown event type '{kind}'")]
    UnknownType { line: usize, kind: String },
}

#[derive(Debug, Deserialize)]
struct ReplayRecordWire {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    raw: Option<serde_json::Value>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    message: Option<AggregatedMessage>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    status: Option<u16>,
}

/// Decode one line. `Ok(None)` for blank and comment lines; the id is `None`
/// when the record carries none.
///
/// # Errors
///
/// Returns [`ReplayError`] when the line is not a valid record.
pub fn parse_record(
    line_no: usize,
    line: &str,
) -> Result<Option<(Option<CorrelationId>, StreamEvent)>, ReplayError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let wire: ReplayRecordWire =
        serde_json::from_str(trimmed).map_err(|source| ReplayError::Json {
            line: line_no,
            source,
        })?;
    let missing = |field| ReplayError::MissingField {
        line: line_no,
        field,
    };

    let id = wire.id.filter(|id| !id.is_empty()).map(CorrelationId::from);
    let kind = wire.kind.ok_or_else(|| missing("type"))?;
    let event = match kind.as_str() {
        "content_delta" => {
            let text = wire.text.ok_or_else(|| missing("text"))?;
            StreamEvent::Content(ContentDelta {
                text,
                raw: wire.raw,
            })
        }
        "tool_call_delta" => StreamEvent::ToolCall(PartialToolCall {
            index: wire.index,
            id: wire.call_id,
            name: wire.name,
            arguments: wire.arguments,
            correlation_id: None,
        }),
        "completed" => StreamEvent::Completed(wire.message.unwrap_or_default()),
        "error" => {
            let message = wire.error.ok_or_else(|| missing("error"))?;
            StreamEvent::Failed(match wire.status {
                Some(status) => StreamError::Upstream { status, message },
                None => StreamError::Transport(message),
            })
        }
        _ => {
            return Err(ReplayError::UnknownType {
                line: line_no,
                kind,
            })
        }
    };
    Ok(Some((id, event)))
}

/// Decode every record of a JSON Lines input, in order.
///
/// # Errors
///
/// Returns the first read or decode failure.
pub fn read_records<R: BufRead>(
    reader: R,
) -> Result<Vec<(CorrelationId, StreamEvent)>, ReplayError> {
    let ids = CorrelationIdGenerator::new();
    let mut anonymous: Option<CorrelationId> = None;
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let Some((id, event)) = parse_record(idx + 1, &line?)? else {
            continue;
        };
        let id = match id {
            Some(id) => id,
            None => anonymous.get_or_insert_with(|| ids.next_id()).clone(),
        };
        records.push((id, event));
    }
    Ok(records)
}

/// Split interleaved records into one event list per id, ordered by first
/// appearance. Per-id event order is preserved.
#[must_use]
pub fn group_by_id(
    records: Vec<(CorrelationId, StreamEvent)>,
) -> Vec<(CorrelationId, Vec<StreamEvent>)> {
    let mut slots: FxHashMap<CorrelationId, usize> = FxHashMap::default();
    let mut streams: Vec<(CorrelationId, Vec<StreamEvent>)> = Vec::new();
    for (id, event) in records {
        let slot = *slots.entry(id.clone()).or_insert_with(|| {
            streams.push((id, Vec::new()));
            streams.len() - 1
        });
        streams[slot].1.push(event);
    }
    streams
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Callback tallies for one correlation id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FragmentCounts {
    pub thinking: usize,
    pub response: usize,
    pub tool_call_deltas: usize,
    pub completed_tool_calls: usize,
}

/// Handler counting callbacks per correlation id.
#[derive(Debug, Default)]
pub struct ReplayHandler {
    counts: Mutex<FxHashMap<CorrelationId, FragmentCounts>>,
}

impl ReplayHandler {
    fn with_counts(&self, correlation_id: &CorrelationId, f: impl FnOnce(&mut FragmentCounts)) {
        let mut counts = self.counts.lock();
        f(counts.entry(correlation_id.clone()).or_default());
    }

    /// Remove and return the tallies for an id.
    pub fn take_counts(&self, correlation_id: &CorrelationId) -> FragmentCounts {
        self.counts.lock().remove(correlation_id).unwrap_or_default()
    }
}

impl StreamHandler for ReplayHandler {
    fn on_partial_thinking(&self, _text: &str, partial: &PartialEvent<'_>) {
        self.with_counts(partial.correlation_id, |c| c.thinking += 1);
    }

    fn on_partial_response(&self, _text: &str, partial: &PartialEvent<'_>) {
        self.with_counts(partial.correlation_id, |c| c.response += 1);
    }

    fn on_partial_tool_call(&self, correlation_id: &CorrelationId, _delta: &PartialToolCall) {
        self.with_counts(correlation_id, |c| c.tool_call_deltas += 1);
    }

    fn on_complete_tool_call(&self, call: &CompletedToolCall) {
        if let Some(correlation_id) = call.correlation_id.as_ref() {
            self.with_counts(correlation_id, |c| c.completed_tool_calls += 1);
        }
    }

    fn on_complete_response(&self, response: &CompletedResponse) {
        tracing::debug!(
            correlation_id = %response.correlation_id,
            "replayed stream completed"
        );
    }

    fn on_error(&self, correlation_id: &CorrelationId, error: &StreamError) {
        tracing::warn!(correlation_id = %correlation_id, "replayed stream failed: {error}");
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Printed outcome of one replayed id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub id: CorrelationId,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ClassificationState>,
    pub thinking: String,
    pub response: String,
    pub tool_calls: Vec<CompletedToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<&'static str>,
    pub callbacks: FragmentCounts,
}

impl ReplaySummary {
    #[must_use]
    pub fn new(
        id: CorrelationId,
        outcome: Result<CompletedResponse, StreamError>,
        callbacks: FragmentCounts,
    ) -> Self {
        match outcome {
            Ok(done) => Self {
                id,
                outcome: "completed",
                state: Some(done.final_state),
                thinking: done.thinking,
                response: done.response,
                tool_calls: done.tool_calls,
                finish_reason: done.message.finish_reason,
                usage: Some(done.usage),
                error: None,
                error_category: None,
                callbacks,
            },
            Err(err) => Self {
                id,
                outcome: if err.is_transport_reported() {
                    "error"
                } else {
                    "abandoned"
                },
                state: None,
                thinking: String::new(),
                response: String::new(),
                tool_calls: Vec::new(),
                finish_reason: None,
                usage: None,
                error: Some(err.to_string()),
                error_category: Some(err.category().as_str()),
                callbacks,
            },
        }
    }
}

/// Drive every stream concurrently, one tokio task per id, and collect one
/// summary per id in input order.
///
/// A stream that ends without a terminal record is cancelled once its events
/// are exhausted.
pub async fn replay(
    demux: &Arc<StreamDemultiplexer<ReplayHandler>>,
    streams: Vec<(CorrelationId, Vec<StreamEvent>)>,
) -> Vec<ReplaySummary> {
    let mut waits = Vec::with_capacity(streams.len());
    for (id, events) in streams {
        let handle = demux.register(id.clone());
        let feeder = {
            let demux = Arc::clone(demux);
            let id = id.clone();
            tokio::spawn(async move {
                let mut terminated = false;
                for event in events {
                    terminated = event.is_terminal();
                    demux.handle(&id, event);
                    tokio::task::yield_now().await;
                }
                if !terminated {
                    tracing::debug!(
                        correlation_id = %id,
                        "replay input ended without a terminal record"
                    );
                    demux.cancel(&id);
                }
            })
        };
        let demux = Arc::clone(demux);
        waits.push(async move {
            if let Err(err) = feeder.await {
                tracing::error!(correlation_id = %id, "replay task failed: {err}");
                demux.cancel(&id);
            }
            let outcome = handle.wait().await;
            let callbacks = demux.handler().take_counts(&id);
            ReplaySummary::new(id, outcome, callbacks)
        });
    }
    join_all(waits).await
}
