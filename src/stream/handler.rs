use crate::correlation::CorrelationId;
use crate::error::StreamError;
use crate::tags::ClassificationState;
use crate::tool_call::{CompletedToolCall, PartialToolCall};

use super::event::{CompletedResponse, ContentDelta};

/// Context passed with every classified text fragment.
#[derive(Debug, Clone, Copy)]
pub struct PartialEvent<'a> {
    pub correlation_id: &'a CorrelationId,
    /// The delta the fragment was classified from, raw provider event included.
    /// Empty for text released when the stream completes.
    pub delta: &'a ContentDelta,
    /// Classification state after the delta was consumed.
    pub state: ClassificationState,
}

/// Callbacks invoked by [`super::StreamDemultiplexer`].
///
/// One handler serves every correlation id of a demultiplexer, possibly from
/// several threads at once. Implementations that aggregate per request must
/// key their state by correlation id in a concurrency-safe container.
///
/// For any id, at most one of `on_complete_response` and `on_error` is
/// called, and nothing is called for the id afterwards.
pub trait StreamHandler: Send + Sync {
    fn on_partial_thinking(&self, text: &str, partial: &PartialEvent<'_>) {
        let _ = (text, partial);
    }

    fn on_partial_response(&self, text: &str, partial: &PartialEvent<'_>) {
        let _ = (text, partial);
    }

    /// Raw tool-call delta, before any merging.
    fn on_partial_tool_call(&self, correlation_id: &CorrelationId, delta: &PartialToolCall) {
        let _ = (correlation_id, delta);
    }

    /// Called once per call index, in index order, right before
    /// `on_complete_response`.
    fn on_complete_tool_call(&self, call: &CompletedToolCall) {
        let _ = call;
    }

    fn on_complete_response(&self, response: &CompletedResponse);

    fn on_error(&self, correlation_id: &CorrelationId, error: &StreamError);
}
