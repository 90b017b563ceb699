//! Unit tests for session event identifiers and SSE wire encoding.

use serde_json::json;
use tabletalk::models::event::{EventKind, SessionEvent};

#[test]
fn sse_frame_has_id_event_and_data_lines() {
    let event = SessionEvent::new(EventKind::RoundStart, "sess-1", json!({"message": "hi"}));
    let frame = event.to_sse();

    let mut lines = frame.lines();
    let id_line = lines.next().expect("id line");
    let event_line = lines.next().expect("event line");
    let data_line = lines.next().expect("data line");

    assert!(id_line.starts_with("id: evt_"), "got: {id_line}");
    assert_eq!(event_line, "event: round_start");
    assert!(data_line.starts_with("data: {"), "got: {data_line}");
    assert!(frame.ends_with("\n\n"), "frame must end with a blank line");
}

#[test]
fn sse_data_line_is_parseable_json() {
    let event = SessionEvent::new(EventKind::Heartbeat, "sess-1", json!({"subscriber": "abc"}));
    let frame = event.to_sse();

    let data = frame
        .lines()
        .find_map(|line| line.strip_prefix("data: "))
        .expect("data line");
    let body: serde_json::Value = serde_json::from_str(data).expect("data is JSON");

    assert_eq!(body["session_id"], "sess-1");
    assert_eq!(body["subscriber"], "abc");
    assert!(body["timestamp"].is_string());
}

#[test]
fn body_merges_payload_over_envelope() {
    // A payload key colliding with the envelope wins.
    let event = SessionEvent::new(
        EventKind::Error,
        "sess-1",
        json!({"session_id": "spoofed", "detail": "boom"}),
    );
    let body = event.body();

    assert_eq!(body["session_id"], "spoofed");
    assert_eq!(body["detail"], "boom");
}

#[test]
fn body_nests_non_object_payload_under_data() {
    let event = SessionEvent::new(EventKind::FileGenerated, "sess-1", json!("report.csv"));
    let body = event.body();

    assert_eq!(body["data"], "report.csv");
    assert_eq!(body["session_id"], "sess-1");
}

#[test]
fn body_with_null_payload_is_envelope_only() {
    let event = SessionEvent::new(EventKind::RoundEnd, "sess-1", serde_json::Value::Null);
    let body = event.body();
    let fields = body.as_object().expect("object body");

    assert_eq!(fields.len(), 2);
    assert!(fields.contains_key("session_id"));
    assert!(fields.contains_key("timestamp"));
}

#[test]
fn event_ids_are_prefixed_and_unique() {
    let first = SessionEvent::new(EventKind::RoundStart, "sess-1", serde_json::Value::Null);
    let second = SessionEvent::new(EventKind::RoundStart, "sess-1", serde_json::Value::Null);

    assert!(first.id.starts_with("evt_"));
    assert!(second.id.starts_with("evt_"));
    assert_ne!(first.id, second.id);
}

#[test]
fn wire_names_round_trip() {
    let kinds = [
        EventKind::RoundStart,
        EventKind::RoundEnd,
        EventKind::PostStart,
        EventKind::PostEnd,
        EventKind::PostError,
        EventKind::PostMessageUpdate,
        EventKind::PostAttachmentUpdate,
        EventKind::PostStatusUpdate,
        EventKind::PostSendToUpdate,
        EventKind::FileGenerated,
        EventKind::Heartbeat,
        EventKind::Error,
        EventKind::SessionCreated,
        EventKind::ChatCompleted,
        EventKind::Shutdown,
    ];
    for kind in kinds {
        assert_eq!(EventKind::from_wire(kind.as_str()), Some(kind));
    }
}

#[test]
fn unknown_wire_name_yields_none() {
    assert_eq!(EventKind::from_wire("telemetry_burst"), None);
    assert_eq!(EventKind::from_wire(""), None);
}

#[test]
fn multi_line_data_gets_one_prefix_per_line() {
    // Serialized JSON is single-line, but a payload containing an embedded
    // newline in a string value must not break framing.
    let event = SessionEvent::new(
        EventKind::PostMessageUpdate,
        "sess-1",
        json!({"content": "line one\nline two"}),
    );
    let frame = event.to_sse();

    let data_lines: Vec<&str> = frame
        .lines()
        .filter(|line| line.starts_with("data: "))
        .collect();
    assert_eq!(
        data_lines.len(),
        1,
        "escaped newline stays inside one JSON line"
    );
}
