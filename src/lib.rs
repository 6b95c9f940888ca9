pub mod config;
pub mod correlation;
pub mod error;
pub mod observability;
pub mod replay;
pub mod stream;
pub mod tags;
pub mod tool_call;

pub(crate) mod json_scan;
mod util;

pub use correlation::CorrelationId;
pub use error::StreamError;
pub use stream::{CompletedResponse, StreamDemultiplexer, StreamEvent, StreamHandler};
pub use tags::{ClassificationState, ExtractionTags, TagStateTracker};
pub use tool_call::{CompletedToolCall, PartialToolCall, ToolCallAccumulator};
