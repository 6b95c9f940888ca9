use super::{CompletedToolCall, PartialToolCall};
use crate::correlation::CorrelationId;
use crate::json_scan::{is_json_object, is_json_string_literal};
use crate::util::next_call_id;

/// Merges the deltas of one tool call (one call index within a session).
///
/// `id`, `name` and `correlation_id` keep the first non-empty value seen;
/// argument fragments are concatenated in arrival order.
#[derive(Debug, Clone)]
pub struct ToolCallAccumulator {
    index: usize,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    correlation_id: Option<CorrelationId>,
    deltas: usize,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            id: None,
            name: None,
            arguments: String::new(),
            correlation_id: None,
            deltas: 0,
        }
    }

    /// Accumulator owned by a session; the session id is the correlation id
    /// unless an earlier value was already set.
    #[must_use]
    pub fn for_session(index: usize, correlation_id: CorrelationId) -> Self {
        let mut acc = Self::new(index);
        acc.correlation_id = Some(correlation_id);
        acc
    }

    /// Raw concatenated arguments so far, before normalization.
    #[must_use]
    pub fn raw_arguments(&self) -> &str {
        &self.arguments
    }

    /// Number of deltas merged.
    #[must_use]
    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    pub fn merge(&mut self, delta: &PartialToolCall) {
        self.deltas += 1;
        keep_first(&mut self.id, delta.id.as_deref());
        keep_first(&mut self.name, delta.name.as_deref());
        if self.correlation_id.is_none() {
            self.correlation_id = delta
                .correlation_id
                .as_ref()
                .filter(|id| !id.as_str().is_empty())
                .cloned();
        }
        if let Some(fragment) = delta.arguments.as_deref() {
            self.arguments.push_str(fragment);
        }
    }

    /// Build the completed call. Missing ids are replaced by a generated
    /// `call_<hex>` id; a missing name becomes empty.
    #[must_use]
    pub fn build(&self) -> CompletedToolCall {
        CompletedToolCall {
            index: self.index,
            id: self.id.clone().unwrap_or_else(next_call_id),
            name: self.name.clone().unwrap_or_default(),
            arguments: normalize_arguments(&self.arguments),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

#[inline]
fn keep_first(slot: &mut Option<String>, value: Option<&str>) {
    if slot.is_some() {
        return;
    }
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        *slot = Some(value.to_string());
    }
}

/// Unwrap arguments the provider double-encoded as a JSON string literal.
///
/// `"{\"a\":1}"` becomes `{"a":1}`. Anything else, including string literals
/// that do not contain a JSON object, is returned unchanged.
#[must_use]
pub fn normalize_arguments(raw: &str) -> String {
    if !is_json_string_literal(raw.as_bytes()) {
        return raw.to_string();
    }
    match serde_json::from_str::<String>(raw) {
        Ok(inner) if is_json_object(inner.as_bytes()) => inner,
        Ok(_) => raw.to_string(),
        Err(err) => {
            tracing::debug!("tool-call arguments look double-encoded but failed to decode: {err}");
            raw.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_never_overwrite() {
        let mut acc = ToolCallAccumulator::new(0);
        acc.merge(&PartialToolCall::at(0).with_name("x"));
        acc.merge(&PartialToolCall::at(0));
        acc.merge(&PartialToolCall::at(0).with_name(""));
        acc.merge(&PartialToolCall::at(0).with_name("y"));
        assert_eq!(acc.build().name, "x");
    }

    #[test]
    fn id_may_arrive_after_name() {
        let mut acc = ToolCallAccumulator::new(2);
        acc.merge(&PartialToolCall::at(2).with_name("lookup"));
        acc.merge(&PartialToolCall::at(2).with_id("").with_arguments("{}"));
        acc.merge(&PartialToolCall::at(2).with_id("call_9"));
        let call = acc.build();
        assert_eq!(call.index, 2);
        assert_eq!(call.id, "call_9");
        assert_eq!(call.name, "lookup");
    }

    #[test]
    fn argument_fragments_concatenate_in_order() {
        let mut acc = ToolCallAccumulator::new(0);
        acc.merge(&PartialToolCall::at(0).with_arguments("{\"a\""));
        acc.merge(&PartialToolCall::at(0));
        acc.merge(&PartialToolCall::at(0).with_arguments(""));
        acc.merge(&PartialToolCall::at(0).with_arguments(":1}"));
        assert_eq!(acc.raw_arguments(), "{\"a\":1}");
        assert_eq!(acc.build().arguments, "{\"a\":1}");
        assert_eq!(acc.delta_count(), 4);
    }

    #[test]
    fn double_encoded_arguments_are_unwrapped() {
        let mut acc = ToolCallAccumulator::new(0);
        acc.merge(&PartialToolCall::at(0).with_arguments("\"{\\\"city\\\":"));
        acc.merge(&PartialToolCall::at(0).with_arguments("\\\"Paris\\\"}\""));
        let call = acc.build();
        assert_eq!(call.arguments, "{\"city\":\"Paris\"}");
        assert_eq!(call.arguments_json().unwrap()["city"], "Paris");
    }

    #[test]
    fn string_literal_without_object_is_kept() {
        assert_eq!(normalize_arguments("\"just text\""), "\"just text\"");
        assert_eq!(normalize_arguments("\"[1,2]\""), "\"[1,2]\"");
        assert_eq!(normalize_arguments("\"{broken\""), "\"{broken\"");
        assert_eq!(normalize_arguments("{\"a\":1"), "{\"a\":1");
        assert_eq!(normalize_arguments(""), "");
    }

    #[test]
    fn session_correlation_id_wins() {
        let mut acc = ToolCallAccumulator::for_session(0, CorrelationId::from("req-a"));
        let mut delta = PartialToolCall::at(0);
        delta.correlation_id = Some(CorrelationId::from("req-b"));
        acc.merge(&delta);
        assert_eq!(acc.build().correlation_id, Some(CorrelationId::from("req-a")));
    }

    #[test]
    fn correlation_id_taken_from_first_delta() {
        let mut acc = ToolCallAccumulator::new(0);
        let mut first = PartialToolCall::at(0);
        first.correlation_id = Some(CorrelationId::from("req-a"));
        let mut second = PartialToolCall::at(0);
        second.correlation_id = Some(CorrelationId::from("req-b"));
        acc.merge(&first);
        acc.merge(&second);
        assert_eq!(acc.build().correlation_id, Some(CorrelationId::from("req-a")));
    }

    #[test]
    fn missing_id_is_generated() {
        let call = ToolCallAccumulator::new(1).build();
        assert!(call.id.starts_with("call_"));
        assert_eq!(call.name, "");
        assert_eq!(call.arguments_json().unwrap(), serde_json::json!({}));
    }
}
