use std::sync::Arc;

use parking_lot::Mutex;
use reasonstream::stream::{AggregatedMessage, CompletedResponse, StreamDemultiplexer, StreamEvent};
use reasonstream::tool_call::{normalize_arguments, ToolCallAccumulator};
use reasonstream::{
    CompletedToolCall, CorrelationId, ExtractionTags, PartialToolCall, StreamError, StreamHandler,
};

#[derive(Default)]
struct ToolRecorder {
    partial: Mutex<Vec<(CorrelationId, PartialToolCall)>>,
    completed: Mutex<Vec<CompletedToolCall>>,
    responses: Mutex<Vec<CompletedResponse>>,
}

impl StreamHandler for ToolRecorder {
    fn on_partial_tool_call(&self, correlation_id: &CorrelationId, delta: &PartialToolCall) {
        self.partial.lock().push((correlation_id.clone(), delta.clone()));
    }

    fn on_complete_tool_call(&self, call: &CompletedToolCall) {
        self.completed.lock().push(call.clone());
    }

    fn on_complete_response(&self, response: &CompletedResponse) {
        self.responses.lock().push(response.clone());
    }

    fn on_error(&self, _correlation_id: &CorrelationId, error: &StreamError) {
        panic!("unexpected error: {error}");
    }
}

fn demux() -> StreamDemultiplexer<ToolRecorder> {
    StreamDemultiplexer::new(Arc::new(ToolRecorder::default()), ExtractionTags::default())
}

#[test]
fn null_name_does_not_overwrite() {
    let mut acc = ToolCallAccumulator::new(0);
    acc.merge(&PartialToolCall::at(0).with_name("x"));
    acc.merge(&PartialToolCall {
        index: Some(0),
        name: None,
        ..PartialToolCall::default()
    });
    assert_eq!(acc.build().name, "x");
}

#[test]
fn argument_chunks_concatenate_exactly() {
    let mut acc = ToolCallAccumulator::new(0);
    for chunk in ["{", "\"a\"", ":", "1", "}"] {
        acc.merge(&PartialToolCall::at(0).with_arguments(chunk));
    }
    assert_eq!(acc.build().arguments, r#"{"a":1}"#);
}

#[test]
fn double_encoded_arguments_unwrap_one_level() {
    assert_eq!(
        normalize_arguments(r#""{\"q\":\"rust \\\"async\\\"\"}""#),
        r#"{"q":"rust \"async\""}"#
    );
    // Only one level is removed.
    assert_eq!(
        normalize_arguments(r#""\"{\\\"a\\\":1}\"""#),
        r#""\"{\\\"a\\\":1}\"""#
    );
}

#[test]
fn wire_deltas_deserialize_with_missing_fields() {
    let delta: PartialToolCall = serde_json::from_str(r#"{"index":1,"arguments":"{}"}"#).unwrap();
    assert_eq!(delta.index, Some(1));
    assert_eq!(delta.id, None);
    assert_eq!(delta.arguments.as_deref(), Some("{}"));
}

#[test]
fn interleaved_call_indices_complete_in_index_order() {
    let d = demux();
    let id = CorrelationId::from("req-tools");
    let deltas = [
        PartialToolCall::at(1).with_name("search"),
        PartialToolCall::at(0).with_id("call_a").with_name("weather"),
        PartialToolCall::at(1).with_arguments("{\"q\":"),
        PartialToolCall::at(0).with_arguments("{\"city\":\"Oslo\"}"),
        PartialToolCall::at(1).with_id("call_b").with_arguments("\"rust\"}"),
    ];
    for delta in deltas.iter().cloned() {
        d.handle(&id, StreamEvent::ToolCall(delta));
    }
    d.handle(&id, StreamEvent::Completed(AggregatedMessage::default()));

    let handler = d.handler();
    assert_eq!(handler.partial.lock().len(), 5);
    assert!(handler.partial.lock().iter().all(|(cid, _)| *cid == id));

    let completed = handler.completed.lock().clone();
    assert_eq!(completed.len(), 2);
    assert_eq!(
        (completed[0].index, completed[0].id.as_str(), completed[0].name.as_str()),
        (0, "call_a", "weather")
    );
    assert_eq!(completed[0].arguments_json().unwrap()["city"], "Oslo");
    assert_eq!(
        (completed[1].index, completed[1].id.as_str(), completed[1].name.as_str()),
        (1, "call_b", "search")
    );
    assert_eq!(completed[1].arguments, r#"{"q":"rust"}"#);
    assert!(completed
        .iter()
        .all(|call| call.correlation_id.as_ref() == Some(&id)));

    let responses = handler.responses.lock();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].tool_calls, completed);
}

#[test]
fn delta_without_index_is_dropped_without_aborting() {
    let d = demux();
    let id = CorrelationId::from("req-malformed");
    d.handle(&id, StreamEvent::ToolCall(PartialToolCall::default().with_name("orphan")));
    d.handle(&id, StreamEvent::ToolCall(PartialToolCall::at(0).with_name("kept")));
    d.handle(&id, StreamEvent::content("text"));
    d.handle(&id, StreamEvent::Completed(AggregatedMessage::default()));

    let handler = d.handler();
    assert_eq!(handler.partial.lock().len(), 1);
    let completed = handler.completed.lock();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].name, "kept");
    assert!(completed[0].id.starts_with("call_"));
    assert_eq!(handler.responses.lock()[0].response, "text");
    assert_eq!(d.stats().dropped_events, 1);
}

#[test]
fn tool_calls_of_different_ids_stay_apart() {
    let d = demux();
    let a = CorrelationId::from("a");
    let b = CorrelationId::from("b");
    let first = |name: &str, args: &str| {
        StreamEvent::ToolCall(PartialToolCall::at(0).with_name(name).with_arguments(args))
    };
    d.handle(&a, first("fa", "{\"x\":"));
    d.handle(&b, first("fb", "{\"y\":"));
    d.handle(&a, StreamEvent::ToolCall(PartialToolCall::at(0).with_arguments("1}")));
    d.handle(&b, StreamEvent::ToolCall(PartialToolCall::at(0).with_arguments("2}")));
    d.handle(&b, StreamEvent::Completed(AggregatedMessage::default()));
    d.handle(&a, StreamEvent::Completed(AggregatedMessage::default()));

    let completed = d.handler().completed.lock().clone();
    let by_name = |name: &str| completed.iter().find(|c| c.name == name).unwrap().clone();
    assert_eq!(by_name("fa").arguments, r#"{"x":1}"#);
    assert_eq!(by_name("fa").correlation_id, Some(a));
    assert_eq!(by_name("fb").arguments, r#"{"y":2}"#);
    assert_eq!(by_name("fb").correlation_id, Some(b));
}
