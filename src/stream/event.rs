use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;
use crate::error::StreamError;
use crate::tags::ClassificationState;
use crate::tool_call::{CompletedToolCall, PartialToolCall};

/// One event delivered by the transport for a correlation id.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Content(ContentDelta),
    ToolCall(PartialToolCall),
    /// Successful end of the stream.
    Completed(AggregatedMessage),
    /// The stream failed; nothing further arrives for the id.
    Failed(StreamError),
}

impl StreamEvent {
    #[must_use]
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content(ContentDelta::new(text))
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed(_) | StreamEvent::Failed(_))
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Content(_) => "content_delta",
            StreamEvent::ToolCall(_) => "tool_call_delta",
            StreamEvent::Completed(_) => "completed",
            StreamEvent::Failed(_) => "error",
        }
    }
}

/// A text fragment plus the provider event it was extracted from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentDelta {
    pub text: String,
    pub raw: Option<serde_json::Value>,
}

impl ContentDelta {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw: None,
        }
    }

    #[must_use]
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[serde(alias = "stop", alias = "end_turn", alias = "STOP")]
    EndOfTurn,
    #[serde(alias = "tool_use", alias = "function_call")]
    ToolCalls,
    #[serde(alias = "length", alias = "MAX_TOKENS")]
    MaxTokens,
    #[serde(alias = "SAFETY")]
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, alias = "prompt_tokens")]
    pub input_tokens: Option<u64>,
    #[serde(default, alias = "completion_tokens")]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

impl TokenUsage {
    /// Reported total, or the sum of both sides when the provider omitted it.
    #[must_use]
    pub fn total(&self) -> Option<u64> {
        self.total_tokens.or_else(|| match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
        })
    }
}

/// The transport's own view of the finished message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Final outcome of a session, handed to
/// [`super::StreamHandler::on_complete_response`] and to the completion handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedResponse {
    pub correlation_id: CorrelationId,
    pub message: AggregatedMessage,
    /// Every thinking fragment of the session, concatenated.
    pub thinking: String,
    /// Every response fragment of the session, concatenated. In
    /// `NO_THINKING` sessions this is the whole content.
    pub response: String,
    /// Completed tool calls in call-index order.
    pub tool_calls: Vec<CompletedToolCall>,
    pub final_state: ClassificationState,
    /// Provider-reported usage, output tokens estimated when missing.
    pub usage: TokenUsage,
}
