//! Per-request stream interpretation: events in, classified callbacks out.

pub mod demux;
pub mod event;
pub mod handler;
pub mod session;

pub use demux::{CompletionHandle, DemuxOptions, DemuxStats, StreamDemultiplexer};
pub use event::{
    AggregatedMessage, CompletedResponse, ContentDelta, FinishReason, StreamEvent, TokenUsage,
};
pub use handler::{PartialEvent, StreamHandler};
pub use session::StreamSession;
