//! End-to-end tests over the HTTP API: REST routes, error mapping, and
//! the live event stream.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tabletalk::http::AppState;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{test_config, test_stack, MockRuntime, StaticMemory};

/// Boot the full service on an ephemeral port with the given engine mock.
///
/// Returns the base URL, a token that stops the server, and the tempdir
/// backing the workspace root, which must outlive the test.
async fn spawn_server_with(
    runtime: &Arc<MockRuntime>,
) -> (String, CancellationToken, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().to_str().expect("utf8");

    // Discover a free port, then configure the server to use it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let mut config = test_config(root);
    config.http_port = port;
    let config = Arc::new(config);

    let memory = StaticMemory::at_percent(20.0);
    let (manager, broadcaster, turns) = test_stack(&config, runtime, &memory);
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        manager,
        broadcaster,
        turns,
    });

    let ct = CancellationToken::new();
    let server_ct = ct.clone();
    tokio::spawn(async move {
        let _ = tabletalk::http::serve(state, server_ct).await;
    });
    tokio::time::sleep(Duration::from_millis(250)).await;

    (format!("http://127.0.0.1:{port}"), ct, temp)
}

async fn spawn_server() -> (String, CancellationToken, tempfile::TempDir) {
    spawn_server_with(&MockRuntime::echo("analysis complete")).await
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (base_url, ct, _workspace) = spawn_server().await;

    let resp = reqwest::get(format!("{base_url}/health"))
        .await
        .expect("GET /health");

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");
    ct.cancel();
}

#[tokio::test]
async fn create_session_generates_an_id_when_omitted() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({}))
        .send()
        .await
        .expect("POST create");

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "created");
    let id = body["session_id"].as_str().expect("id string");
    assert!(!id.is_empty());
    ct.cancel();
}

#[tokio::test]
async fn create_session_honors_requested_id_and_records_origin() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({"session_id": "alpha", "config": {"model": "custom"}}))
        .send()
        .await
        .expect("POST create");
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["session_id"], "alpha");

    let snapshot: Value = client
        .get(format!("{base_url}/api/session/alpha"))
        .send()
        .await
        .expect("GET session")
        .json()
        .await
        .expect("snapshot json");

    assert_eq!(snapshot["id"], "alpha");
    assert_eq!(snapshot["status"], "active");
    assert_eq!(snapshot["config"]["model"], "custom");
    assert_eq!(snapshot["meta"]["client_ip"], "127.0.0.1");
    ct.cancel();
}

#[tokio::test]
async fn unknown_session_maps_to_404_with_detail() {
    let (base_url, ct, _workspace) = spawn_server().await;

    let resp = reqwest::get(format!("{base_url}/api/session/ghost"))
        .await
        .expect("GET session");

    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["detail"], "not found: session ghost");
    ct.cancel();
}

#[tokio::test]
async fn list_reflects_created_sessions() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    for id in ["a", "b"] {
        client
            .post(format!("{base_url}/api/session/create"))
            .json(&json!({"session_id": id}))
            .send()
            .await
            .expect("POST create");
    }

    let body: Value = client
        .get(format!("{base_url}/api/session/list"))
        .send()
        .await
        .expect("GET list")
        .json()
        .await
        .expect("list json");

    assert_eq!(body["count"], 2);
    assert_eq!(body["sessions"].as_array().expect("array").len(), 2);
    ct.cancel();
}

#[tokio::test]
async fn heartbeat_touches_known_sessions_only() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({"session_id": "hb"}))
        .send()
        .await
        .expect("POST create");

    let resp = client
        .post(format!("{base_url}/api/session/hb/heartbeat"))
        .send()
        .await
        .expect("POST heartbeat");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "ok");

    let missing = client
        .post(format!("{base_url}/api/session/ghost/heartbeat"))
        .send()
        .await
        .expect("POST heartbeat");
    assert_eq!(missing.status(), 404);
    ct.cancel();
}

#[tokio::test]
async fn delete_session_removes_it_and_is_not_repeatable() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({"session_id": "gone"}))
        .send()
        .await
        .expect("POST create");

    let resp = client
        .delete(format!("{base_url}/api/session/gone"))
        .send()
        .await
        .expect("DELETE session");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "deleted");
    assert_eq!(body["turn_cancelled"], false);

    let lookup = reqwest::get(format!("{base_url}/api/session/gone"))
        .await
        .expect("GET session");
    assert_eq!(lookup.status(), 404);

    let again = client
        .delete(format!("{base_url}/api/session/gone"))
        .send()
        .await
        .expect("DELETE session twice");
    assert_eq!(again.status(), 404);
    ct.cancel();
}

#[tokio::test]
async fn config_update_patches_the_session() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({"session_id": "cfg"}))
        .send()
        .await
        .expect("POST create");

    let resp = client
        .post(format!("{base_url}/api/session/cfg/config"))
        .json(&json!({"model": "analyst-xl"}))
        .send()
        .await
        .expect("POST config");
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "updated");

    let snapshot: Value = client
        .get(format!("{base_url}/api/session/cfg"))
        .send()
        .await
        .expect("GET session")
        .json()
        .await
        .expect("snapshot json");
    assert_eq!(snapshot["config"]["model"], "analyst-xl");

    let missing = client
        .post(format!("{base_url}/api/session/ghost/config"))
        .json(&json!({"model": "x"}))
        .send()
        .await
        .expect("POST config");
    assert_eq!(missing.status(), 404);
    ct.cancel();
}

#[tokio::test]
async fn message_is_accepted_and_lands_in_history() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/api/chat/message/chat"))
        .json(&json!({"message": "run the numbers"}))
        .send()
        .await
        .expect("POST message");
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "accepted");

    // The turn completes in the background; poll until the reply shows up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let history: Value = client
            .get(format!("{base_url}/api/chat/history/chat"))
            .send()
            .await
            .expect("GET history")
            .json()
            .await
            .expect("history json");
        if history["count"] == 2 {
            assert_eq!(history["messages"][0]["role"], "user");
            assert_eq!(history["messages"][0]["content"], "run the numbers");
            assert_eq!(history["messages"][1]["role"], "assistant");
            assert_eq!(history["messages"][1]["content"], "analysis complete");
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "turn never completed: {history}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    ct.cancel();
}

#[tokio::test]
async fn blank_message_is_rejected() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base_url}/api/chat/message/chat"))
        .json(&json!({"message": "   "}))
        .send()
        .await
        .expect("POST message");

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["detail"], "message must not be empty");
    ct.cancel();
}

#[tokio::test]
async fn history_of_unknown_session_is_404() {
    let (base_url, ct, _workspace) = spawn_server().await;

    let resp = reqwest::get(format!("{base_url}/api/chat/history/ghost"))
        .await
        .expect("GET history");

    assert_eq!(resp.status(), 404);
    ct.cancel();
}

#[tokio::test]
async fn concurrent_message_maps_turn_conflict_to_409() {
    let runtime = MockRuntime::slow("slow reply", Duration::from_millis(500));
    let (base_url, ct, _workspace) = spawn_server_with(&runtime).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{base_url}/api/chat/message/busy"))
        .json(&json!({"message": "first"}))
        .send()
        .await
        .expect("POST first message");
    assert_eq!(first.status(), 202);

    let second = client
        .post(format!("{base_url}/api/chat/message/busy"))
        .json(&json!({"message": "second"}))
        .send()
        .await
        .expect("POST second message");
    assert_eq!(second.status(), 409);
    let body: Value = second.json().await.expect("json body");
    let detail = body["detail"].as_str().expect("detail string");
    assert!(detail.contains("already in progress"), "got: {detail}");
    ct.cancel();
}

#[tokio::test]
async fn stats_report_each_subsystem() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base_url}/api/session/create"))
        .json(&json!({"session_id": "s1"}))
        .send()
        .await
        .expect("POST create");

    let body: Value = client
        .get(format!("{base_url}/api/system/stats"))
        .send()
        .await
        .expect("GET stats")
        .json()
        .await
        .expect("stats json");

    assert_eq!(body["session_manager"]["total_sessions"], 1);
    assert_eq!(body["session_manager"]["max_sessions"], 10);
    assert_eq!(body["event_broadcaster"]["running"], true);
    assert_eq!(body["active_turns"], 0);
    ct.cancel();
}

#[tokio::test]
async fn cleanup_endpoint_returns_a_report() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{base_url}/api/system/cleanup"))
        .send()
        .await
        .expect("POST cleanup")
        .json()
        .await
        .expect("report json");

    assert_eq!(body["sessions_cleaned"], 0);
    assert!(body["before_memory"]["percent"].is_number());
    assert!(body["after_memory"]["percent"].is_number());
    ct.cancel();
}

#[tokio::test]
async fn event_stream_opens_with_a_connection_heartbeat() {
    let (base_url, ct, _workspace) = spawn_server().await;
    let client = reqwest::Client::new();

    let mut resp = client
        .get(format!("{base_url}/api/chat/stream/fresh"))
        .send()
        .await
        .expect("GET stream");

    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"), "got: {content_type}");

    let chunk = resp.chunk().await.expect("chunk result").expect("first frame");
    let text = String::from_utf8_lossy(&chunk);
    assert!(text.contains("event: heartbeat"), "got: {text}");
    assert!(text.contains("connection established"), "got: {text}");
    drop(resp);

    // Opening the stream created the session on the spot.
    let lookup = reqwest::get(format!("{base_url}/api/session/fresh"))
        .await
        .expect("GET session");
    assert_eq!(lookup.status(), 200);
    ct.cancel();
}
