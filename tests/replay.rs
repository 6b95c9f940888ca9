use std::sync::Arc;

use reasonstream::replay::{group_by_id, read_records, replay, ReplayError, ReplayHandler};
use reasonstream::stream::{DemuxOptions, FinishReason, StreamDemultiplexer, StreamEvent};
use reasonstream::{ClassificationState, ExtractionTags};

const RECORDING: &str = r#"
# two interleaved chat streams and one that fails
{"id":"req-1","type":"content_delta","text":"<think>","raw":{"choices":[{"delta":{"content":"<think>"}}]}}
{"id":"req-2","type":"content_delta","text":"Plain answer"}
{"id":"req-1","type":"content_delta","text":"check the map</thi"}
{"id":"req-3","type":"content_delta","text":"<think>hmm"}
{"id":"req-1","type":"content_delta","text":"nk>Take the"}
{"id":"req-1","type":"tool_call_delta","index":0,"call_id":"call_1","name":"route"}
{"id":"req-2","type":"completed","message":{"model":"m-small","finish_reason":"stop","usage":{"prompt_tokens":5,"completion_tokens":3}}}
{"id":"req-1","type":"content_delta","text":" bridge."}
{"id":"req-1","type":"tool_call_delta","index":0,"arguments":"\"{\\\"to\\\":\\\"north\\\"}\""}
{"id":"req-3","type":"error","error":"upstream overloaded","status":529}
{"id":"req-1","type":"completed","message":{"model":"m-large","finish_reason":"tool_calls"}}
{"id":"req-4","type":"content_delta","text":"never finished"}
"#;

fn demux() -> Arc<StreamDemultiplexer<ReplayHandler>> {
    Arc::new(StreamDemultiplexer::with_options(
        Arc::new(ReplayHandler::default()),
        ExtractionTags::single("think").unwrap(),
        DemuxOptions::default(),
    ))
}

#[test]
fn records_decode_in_order() {
    let records = read_records(RECORDING.as_bytes()).unwrap();
    assert_eq!(records.len(), 12);
    assert_eq!(records[0].0.as_str(), "req-1");
    match &records[0].1 {
        StreamEvent::Content(delta) => {
            assert_eq!(delta.text, "<think>");
            assert!(delta.raw.is_some());
        }
        other => panic!("unexpected event {other:?}"),
    }
    let grouped = group_by_id(records);
    let ids: Vec<&str> = grouped.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, ["req-1", "req-2", "req-3", "req-4"]);
    assert_eq!(grouped[0].1.len(), 7);
}

#[test]
fn decode_errors_carry_line_numbers() {
    let input = "{\"id\":\"a\",\"type\":\"content_delta\",\"text\":\"x\"}\n\n{\"id\":\"a\"}\n";
    match read_records(input.as_bytes()) {
        Err(ReplayError::MissingField { line, field }) => {
            assert_eq!((line, field), (3, "type"));
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_summarizes_every_stream() {
    let streams = group_by_id(read_records(RECORDING.as_bytes()).unwrap());
    let d = demux();
    let summaries = replay(&d, streams).await;
    assert_eq!(summaries.len(), 4);

    let tool_stream = &summaries[0];
    assert_eq!(tool_stream.outcome, "completed");
    assert_eq!(tool_stream.thinking, "check the map");
    assert_eq!(tool_stream.response, "Take the bridge.");
    assert_eq!(tool_stream.state, Some(ClassificationState::Response));
    assert_eq!(tool_stream.finish_reason, Some(FinishReason::ToolCalls));
    assert_eq!(tool_stream.tool_calls.len(), 1);
    assert_eq!(tool_stream.tool_calls[0].id, "call_1");
    assert_eq!(tool_stream.tool_calls[0].arguments, r#"{"to":"north"}"#);
    assert_eq!(tool_stream.callbacks.tool_call_deltas, 2);
    assert_eq!(tool_stream.callbacks.completed_tool_calls, 1);

    let plain = &summaries[1];
    assert_eq!(plain.state, Some(ClassificationState::NoThinking));
    assert_eq!(plain.response, "Plain answer");
    assert_eq!(plain.callbacks.response, 1);
    assert_eq!(plain.usage.and_then(|u| u.total_tokens), Some(8));

    let failed = &summaries[2];
    assert_eq!(failed.outcome, "error");
    assert_eq!(failed.error_category, Some("server_error"));
    assert_eq!(failed.callbacks.thinking, 1);

    let unfinished = &summaries[3];
    assert_eq!(unfinished.outcome, "abandoned");
    assert_eq!(unfinished.error_category, Some("abandoned"));

    assert_eq!(d.active_sessions(), 0);
}

#[tokio::test]
async fn summaries_serialize_as_json_lines() {
    let streams = group_by_id(read_records(RECORDING.as_bytes()).unwrap());
    let summaries = replay(&demux(), streams).await;
    let line = serde_json::to_value(&summaries[1]).unwrap();
    assert_eq!(line["id"], "req-2");
    assert_eq!(line["state"], "NO_THINKING");
    assert_eq!(line["finish_reason"], "end_of_turn");
    assert!(line.get("error").is_none());
}
