pub mod accumulator;

use serde::{Deserialize, Serialize};

use crate::correlation::CorrelationId;

pub use accumulator::{normalize_arguments, ToolCallAccumulator};

/// One incremental tool-invocation delta as emitted by the provider.
///
/// Every field may be missing on any given delta. A delta without an `index`
/// cannot be routed and is dropped by the demultiplexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialToolCall {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

impl PartialToolCall {
    #[must_use]
    pub fn at(index: usize) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, fragment: impl Into<String>) -> Self {
        self.arguments = Some(fragment.into());
        self
    }
}

/// A fully reassembled tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    /// Concatenated argument fragments, unwrapped one level when the provider
    /// double-encoded the JSON object as a string literal.
    pub arguments: String,
    pub correlation_id: Option<CorrelationId>,
}

impl CompletedToolCall {
    /// Parse the arguments as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the arguments are not valid JSON,
    /// which happens when the model produced malformed arguments.
    pub fn arguments_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}
