use std::sync::Arc;

use super::marker::{next_candidate, MarkerMatch, MarkerSet, TagMarkers};
use super::{ClassificationResult, ClassificationState, ExtractionTags};

// Streaming reasoning/answer classifier.
//
// The tracker scans text deltas as they arrive and splits them into reasoning
// ("thinking") and final-answer ("response") content using the configured
// tag pair. It never fails: anything that is not a marker is either flushed
// under the current phase or, before the first marker, switches the stream to
// plain pass-through.
//
// Key invariants:
// - Only a candidate marker prefix is ever held back, so the pending buffer
//   stays shorter than the longest marker form.
// - Feeding a string in one call or one character at a time yields the same
//   concatenated output.
// - Phases only move forward; once the stream is NO_THINKING or past the
//   final answer it stays there.

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Internal phase. Finer grained than [`ClassificationState`]: the public
/// UNKNOWN and RESPONSE states each cover two phases that await different
/// markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Awaiting the opening `start` marker at the very beginning.
    Start,
    /// Inside reasoning, awaiting the closing `start` marker.
    Thinking,
    /// Two-tag mode: reasoning closed, awaiting the opening `end` marker.
    BetweenSections,
    /// Two-tag mode: inside the answer, awaiting the closing `end` marker.
    Response,
    /// Single-tag mode: inside the answer, nothing left to await.
    OpenResponse,
    /// The stream never opened the reasoning tag.
    NoThinking,
    /// Two-tag mode: the answer closed. Remaining input is dropped.
    AfterResponse,
}

impl Phase {
    fn state(self) -> ClassificationState {
        match self {
            Phase::Start => ClassificationState::Start,
            Phase::Thinking => ClassificationState::Thinking,
            Phase::BetweenSections | Phase::AfterResponse => ClassificationState::Unknown,
            Phase::Response | Phase::OpenResponse => ClassificationState::Response,
            Phase::NoThinking => ClassificationState::NoThinking,
        }
    }

    fn sink(self) -> Sink {
        match self {
            Phase::Thinking => Sink::Thinking,
            Phase::Response | Phase::OpenResponse | Phase::NoThinking => Sink::Response,
            Phase::Start | Phase::BetweenSections | Phase::AfterResponse => Sink::Discard,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sink {
    Thinking,
    Response,
    Discard,
}

#[derive(Debug, Default)]
struct Emission {
    thinking: String,
    response: String,
}

impl Emission {
    #[inline]
    fn push(&mut self, sink: Sink, text: &str) {
        if text.is_empty() {
            return;
        }
        match sink {
            Sink::Thinking => self.thinking.push_str(text),
            Sink::Response => self.response.push_str(text),
            Sink::Discard => {}
        }
    }

    fn into_result(self, state: ClassificationState) -> ClassificationResult {
        ClassificationResult {
            state,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            response: (!self.response.is_empty()).then_some(self.response),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Per-session reasoning/answer classifier.
#[derive(Debug, Clone)]
pub struct TagStateTracker {
    markers: Arc<TagMarkers>,
    phase: Phase,
    /// Unresolved candidate marker prefix carried over from the last fragment.
    pending: String,
}

impl TagStateTracker {
    #[must_use]
    pub fn new(tags: ExtractionTags) -> Self {
        Self::with_markers(Arc::new(TagMarkers::new(tags)))
    }

    /// Create a tracker sharing precomputed markers with other sessions.
    #[must_use]
    pub fn with_markers(markers: Arc<TagMarkers>) -> Self {
        Self {
            markers,
            phase: Phase::Start,
            pending: String::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ClassificationState {
        self.phase.state()
    }

    #[must_use]
    pub fn tags(&self) -> &ExtractionTags {
        self.markers.tags()
    }

    /// Bytes currently held back as a possible marker prefix.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // -- public API ---------------------------------------------------------

    /// Feed the next text fragment of the stream.
    pub fn update(&mut self, fragment: &str) -> ClassificationResult {
        let mut out = Emission::default();
        if fragment.is_empty() {
            return out.into_result(self.state());
        }

        let joined;
        let input = if self.pending.is_empty() {
            fragment
        } else {
            let mut buffered = std::mem::take(&mut self.pending);
            buffered.push_str(fragment);
            joined = buffered;
            joined.as_str()
        };

        let before = self.phase;
        scan(
            &self.markers,
            &mut self.phase,
            &mut self.pending,
            input,
            &mut out,
        );
        if before != self.phase {
            tracing::trace!(
                from = %before.state(),
                to = %self.phase.state(),
                "tag classification state changed"
            );
        }
        out.into_result(self.state())
    }

    /// Call when the stream ends. Flushes a held-back marker prefix under the
    /// current phase; an unresolved prefix before the first marker is
    /// surfaced as plain content.
    pub fn finish(&mut self) -> ClassificationResult {
        let mut out = Emission::default();
        if !self.pending.is_empty() {
            let remaining = std::mem::take(&mut self.pending);
            if self.phase == Phase::Start {
                self.phase = Phase::NoThinking;
            }
            out.push(self.phase.sink(), &remaining);
        }
        out.into_result(self.state())
    }
}

// -- scanning ---------------------------------------------------------------

fn scan(
    markers: &TagMarkers,
    phase: &mut Phase,
    pending: &mut String,
    input: &str,
    out: &mut Emission,
) {
    let bytes = input.as_bytes();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let awaited: &MarkerSet = match *phase {
            Phase::NoThinking | Phase::OpenResponse => {
                out.push(phase.sink(), &input[pos..]);
                return;
            }
            Phase::AfterResponse => return,
            Phase::Start => {
                // Anchored: the stream must open with the start marker.
                match markers.start_open.match_at(&bytes[pos..]) {
                    MarkerMatch::Full(len) => {
                        pos += len;
                        *phase = Phase::Thinking;
                    }
                    MarkerMatch::Partial => {
                        pending.push_str(&input[pos..]);
                        return;
                    }
                    MarkerMatch::Mismatch => *phase = Phase::NoThinking,
                }
                continue;
            }
            Phase::Thinking => &markers.start_close,
            Phase::BetweenSections => match markers.end_open.as_ref() {
                Some(set) => set,
                None => {
                    *phase = Phase::OpenResponse;
                    continue;
                }
            },
            Phase::Response => match markers.end_close.as_ref() {
                Some(set) => set,
                None => {
                    *phase = Phase::OpenResponse;
                    continue;
                }
            },
        };

        let sink = phase.sink();
        let Some(offset) = next_candidate(&bytes[pos..]) else {
            out.push(sink, &input[pos..]);
            return;
        };
        out.push(sink, &input[pos..pos + offset]);
        pos += offset;

        match awaited.match_at(&bytes[pos..]) {
            MarkerMatch::Full(len) => {
                pos += len;
                *phase = next_phase(*phase, markers.tags().is_two_tag());
            }
            MarkerMatch::Partial => {
                pending.push_str(&input[pos..]);
                return;
            }
            MarkerMatch::Mismatch => {
                // Candidate bytes are ASCII, so one byte is one char.
                out.push(sink, &input[pos..=pos]);
                pos += 1;
            }
        }
    }
}

fn next_phase(phase: Phase, two_tag: bool) -> Phase {
    match phase {
        Phase::Start => Phase::Thinking,
        Phase::Thinking if two_tag => Phase::BetweenSections,
        Phase::Thinking => Phase::OpenResponse,
        Phase::BetweenSections => Phase::Response,
        Phase::Response | Phase::AfterResponse => Phase::AfterResponse,
        Phase::OpenResponse => Phase::OpenResponse,
        Phase::NoThinking => Phase::NoThinking,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
