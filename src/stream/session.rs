use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use crate::correlation::CorrelationId;
use crate::error::StreamError;
use crate::observability::usage::session_usage;
use crate::tags::{ClassificationResult, ClassificationState, TagStateTracker};
use crate::tool_call::{PartialToolCall, ToolCallAccumulator};

use super::event::{AggregatedMessage, CompletedResponse};

pub(crate) type CompletionSender = oneshot::Sender<Result<CompletedResponse, StreamError>>;

/// Per-correlation-id interpretation state.
///
/// Owned by the demultiplexer while the id is active and mutated by exactly
/// one flow at a time.
#[derive(Debug)]
pub struct StreamSession {
    correlation_id: CorrelationId,
    tracker: TagStateTracker,
    tool_calls: BTreeMap<usize, ToolCallAccumulator>,
    thinking: String,
    response: String,
    events: u64,
    opened_at: Instant,
}

impl StreamSession {
    #[must_use]
    pub fn new(correlation_id: CorrelationId, tracker: TagStateTracker) -> Self {
        Self {
            correlation_id,
            tracker,
            tool_calls: BTreeMap::new(),
            thinking: String::new(),
            response: String::new(),
            events: 0,
            opened_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    #[must_use]
    pub fn state(&self) -> ClassificationState {
        self.tracker.state()
    }

    /// Events applied so far, terminal event excluded.
    #[must_use]
    pub fn event_count(&self) -> u64 {
        self.events
    }

    /// Time since the session was opened.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    #[must_use]
    pub fn tool_call_count(&self) -> usize {
        self.tool_calls.len()
    }

    /// Thinking text aggregated so far.
    #[must_use]
    pub fn thinking(&self) -> &str {
        &self.thinking
    }

    /// Response text aggregated so far.
    #[must_use]
    pub fn response(&self) -> &str {
        &self.response
    }

    /// Classify one content fragment and fold the emitted text into the
    /// session aggregates.
    pub fn classify(&mut self, text: &str) -> ClassificationResult {
        self.events += 1;
        let result = self.tracker.update(text);
        self.absorb(&result);
        result
    }

    /// Merge a tool-call delta into the accumulator for its index.
    ///
    /// Returns `false` without touching the session when the delta carries
    /// no index.
    pub fn merge_tool_call(&mut self, delta: &PartialToolCall) -> bool {
        let Some(index) = delta.index else {
            return false;
        };
        self.events += 1;
        let correlation_id = &self.correlation_id;
        self.tool_calls
            .entry(index)
            .or_insert_with(|| ToolCallAccumulator::for_session(index, correlation_id.clone()))
            .merge(delta);
        true
    }

    /// Release text the tracker held back as a possible marker prefix and
    /// fold it into the aggregates. Later calls return an empty result.
    pub fn flush(&mut self) -> ClassificationResult {
        let residue = self.tracker.finish();
        self.absorb(&residue);
        residue
    }

    /// Flush the tracker and build the final response. The session is spent
    /// afterwards.
    pub fn finalize(&mut self, message: AggregatedMessage) -> CompletedResponse {
        self.flush();
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|acc| acc.build())
            .collect();
        let usage = session_usage(message.usage.as_ref(), &self.thinking, &self.response);
        CompletedResponse {
            correlation_id: self.correlation_id.clone(),
            message,
            thinking: std::mem::take(&mut self.thinking),
            response: std::mem::take(&mut self.response),
            tool_calls,
            final_state: self.tracker.state(),
            usage,
        }
    }

    fn absorb(&mut self, result: &ClassificationResult) {
        if let Some(text) = result.thinking.as_deref() {
            self.thinking.push_str(text);
        }
        if let Some(text) = result.response.as_deref() {
            self.response.push_str(text);
        }
    }
}

// ---------------------------------------------------------------------------
// Shared cell
// ---------------------------------------------------------------------------

/// A session as stored in the demultiplexer's shard maps.
///
/// The completion sender sits behind its own lock so cancellation and idle
/// expiry can resolve it while a handler callback holds the session lock.
#[derive(Debug)]
pub(crate) struct SessionCell {
    session: Mutex<StreamSession>,
    completion: Mutex<Option<CompletionSender>>,
    closed: AtomicBool,
    last_event_ms: AtomicU64,
}

impl SessionCell {
    pub(crate) fn new(session: StreamSession, now_ms: u64) -> Self {
        Self {
            session: Mutex::new(session),
            completion: Mutex::new(None),
            closed: AtomicBool::new(false),
            last_event_ms: AtomicU64::new(now_ms),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, StreamSession> {
        self.session.lock()
    }

    /// Replace the completion sender. A previously attached waiter observes
    /// `Cancelled`.
    pub(crate) fn attach(&self, sender: CompletionSender) {
        let previous = self.completion.lock().replace(sender);
        if let Some(previous) = previous {
            let _ = previous.send(Err(StreamError::Cancelled));
        }
    }

    pub(crate) fn resolve(&self, outcome: Result<CompletedResponse, StreamError>) {
        let sender = self.completion.lock().take();
        if let Some(sender) = sender {
            // The waiter may have dropped its handle.
            let _ = sender.send(outcome);
        }
    }

    /// Mark the session closed. Returns `true` only for the call that closed it.
    #[inline]
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_event_ms.store(now_ms, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_event_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::ExtractionTags;

    fn session() -> StreamSession {
        StreamSession::new(
            CorrelationId::from("req-1"),
            TagStateTracker::new(ExtractionTags::single("think").unwrap()),
        )
    }

    #[test]
    fn aggregates_thinking_and_response() {
        let mut s = session();
        s.classify("<think>plan");
        s.classify("</think>ans");
        s.classify("wer");
        assert_eq!(s.thinking(), "plan");
        assert_eq!(s.response(), "answer");
        assert_eq!(s.event_count(), 3);
    }

    #[test]
    fn finalize_folds_tracker_residue() {
        let mut s = session();
        s.classify("<thi");
        let done = s.finalize(AggregatedMessage::default());
        assert_eq!(done.response, "<thi");
        assert_eq!(done.final_state, ClassificationState::NoThinking);
        assert_eq!(done.usage.output_tokens, Some(1));
    }

    #[test]
    fn flush_releases_residue_once() {
        let mut s = StreamSession::new(
            CorrelationId::from("req-2"),
            TagStateTracker::new(ExtractionTags::pair("think", "response").unwrap()),
        );
        s.classify("<think>ok</think><response>C:\\");
        assert_eq!(s.response(), "C:");
        let residue = s.flush();
        assert_eq!(residue.response.as_deref(), Some("\\"));
        assert!(s.flush().is_empty());
        let done = s.finalize(AggregatedMessage::default());
        assert_eq!(done.response, "C:\\");
    }

    #[test]
    fn tool_calls_complete_in_index_order() {
        let mut s = session();
        assert!(s.merge_tool_call(&PartialToolCall::at(2).with_name("b")));
        assert!(s.merge_tool_call(&PartialToolCall::at(0).with_name("a")));
        assert!(!s.merge_tool_call(&PartialToolCall::default().with_name("lost")));
        assert_eq!(s.tool_call_count(), 2);
        let done = s.finalize(AggregatedMessage::default());
        let names: Vec<_> = done.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(done
            .tool_calls
            .iter()
            .all(|c| c.correlation_id == Some(CorrelationId::from("req-1"))));
    }

    #[test]
    fn cell_closes_once_and_resolves_once() {
        let cell = SessionCell::new(session(), 10);
        let (tx, mut rx) = oneshot::channel();
        cell.attach(tx);
        assert!(cell.close());
        assert!(!cell.close());
        cell.resolve(Err(StreamError::TimedOut));
        cell.resolve(Err(StreamError::Cancelled));
        assert_eq!(rx.try_recv().unwrap(), Err(StreamError::TimedOut));
        assert_eq!(cell.idle_ms(25), 15);
    }

    #[test]
    fn reattaching_cancels_previous_waiter() {
        let cell = SessionCell::new(session(), 0);
        let (first, mut first_rx) = oneshot::channel();
        let (second, _second_rx) = oneshot::channel();
        cell.attach(first);
        cell.attach(second);
        assert_eq!(first_rx.try_recv().unwrap(), Err(StreamError::Cancelled));
    }
}
