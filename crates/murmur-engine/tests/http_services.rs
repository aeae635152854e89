//! HTTP client and end-to-end session tests.
//!
//! A local axum server stands in for the completion and image services so
//! the reqwest clients are exercised over a real socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use murmur_engine::{
    build_request, start_http_session, ClientError, CompletionService, HttpCompletionClient,
    HttpImageClient, ImageService, LifecycleState, SessionConfig, SessionView, Turn,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Recorded {
    completions: Arc<Mutex<Vec<Value>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

async fn complete(State(recorded): State<Recorded>, Json(body): Json<Value>) -> Json<Value> {
    let last = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    let count = body["messages"].as_array().map_or(0, Vec::len);
    recorded.completions.lock().unwrap().push(body);
    Json(json!({ "message": format!("you said: {last}"), "tokens": count }))
}

async fn complete_failing() -> (StatusCode, &'static str) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal Server Error. OpenAI API call failed.",
    )
}

async fn complete_garbage() -> &'static str {
    "definitely not json"
}

async fn image(
    State(recorded): State<Recorded>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let prompt = params.get("prompt").cloned().unwrap_or_default();
    recorded.prompts.lock().unwrap().push(prompt.clone());
    format!("QkFTRTY0:{}\n", prompt.len())
}

async fn image_failing() -> StatusCode {
    StatusCode::BAD_GATEWAY
}

async fn spawn_server() -> (SocketAddr, Recorded) {
    let recorded = Recorded::default();
    let router = Router::new()
        .route("/api", post(complete))
        .route("/api/fail", post(complete_failing))
        .route("/api/garbage", post(complete_garbage))
        .route("/api/get-image", get(image))
        .route("/api/get-image-fail", get(image_failing))
        .with_state(recorded.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("read local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (addr, recorded)
}

fn pending_turn(user: &str) -> Turn {
    Turn::pending(user)
}

#[tokio::test]
async fn completion_client_posts_wire_payload() {
    let (addr, recorded) = spawn_server().await;
    let client = HttpCompletionClient::new(format!("http://{addr}/api"));

    let request = build_request("gpt-4", "sys", &[pending_turn("hello")], "hello");
    let completion = client.complete(&request).await.expect("completion");

    assert_eq!(completion.message, "you said: hello");
    assert_eq!(completion.tokens, 4);

    let seen = recorded.completions.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["model"], "gpt-4");
    let roles: Vec<&str> = seen[0]["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
}

#[tokio::test]
async fn completion_client_reports_status() {
    let (addr, _recorded) = spawn_server().await;
    let client = HttpCompletionClient::new(format!("http://{addr}/api/fail"));

    let request = build_request("gpt-4", "sys", &[], "hello");
    let err = client.complete(&request).await.expect_err("should fail");

    match err {
        ClientError::Status { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("OpenAI API call failed"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn completion_client_reports_bad_body() {
    let (addr, _recorded) = spawn_server().await;
    let client = HttpCompletionClient::new(format!("http://{addr}/api/garbage"));

    let request = build_request("gpt-4", "sys", &[], "hello");
    let err = client.complete(&request).await.expect_err("should fail");
    assert!(matches!(err, ClientError::Decode(_)), "got {err}");
}

#[tokio::test]
async fn completion_client_reports_transport_error() {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("reserve addr");
    let addr = probe.local_addr().expect("read addr");
    drop(probe);

    let client = HttpCompletionClient::new(format!("http://{addr}/api"));
    let request = build_request("gpt-4", "sys", &[], "hello");
    let err = client.complete(&request).await.expect_err("should fail");
    assert!(matches!(err, ClientError::Http(_)), "got {err}");
}

#[tokio::test]
async fn image_client_encodes_prompt() {
    let (addr, recorded) = spawn_server().await;
    let client = HttpImageClient::new(format!("http://{addr}/api/get-image"));

    let prompt = "a cat & a dog? 100% yes";
    let artifact = client.fetch_image(prompt).await.expect("image");

    assert_eq!(artifact.prompt, prompt);
    assert_eq!(artifact.base64, format!("QkFTRTY0:{}", prompt.len()));
    assert_eq!(*recorded.prompts.lock().unwrap(), vec![prompt.to_string()]);
}

#[tokio::test]
async fn image_client_reports_status() {
    let (addr, _recorded) = spawn_server().await;
    let client = HttpImageClient::new(format!("http://{addr}/api/get-image-fail"));

    let err = client.fetch_image("anything").await.expect_err("should fail");
    assert!(matches!(err, ClientError::Status { status: 502, .. }));
}

fn settled(view: &SessionView) -> bool {
    view.lifecycle == LifecycleState::Idle
        && view.reveal_prefix.is_none()
        && !view.turns.is_empty()
        && view.turns.iter().all(|t| !t.bot.is_empty())
}

#[tokio::test]
async fn session_over_http() {
    let (addr, recorded) = spawn_server().await;
    let config = SessionConfig {
        completion_url: format!("http://{addr}/api"),
        image_url: format!("http://{addr}/api/get-image"),
        reveal_interval_ms: 1,
        ..Default::default()
    };
    let (handle, _events, task) = start_http_session(config).expect("valid config");

    handle.submit("hello").expect("submit");
    let view = handle
        .wait_for(settled, Duration::from_secs(10))
        .await
        .expect("turn finalized");
    assert_eq!(view.turns.len(), 1);
    assert_eq!(view.turns[0].bot, "you said: hello");
    assert_eq!(view.last_outcome, Some(LifecycleState::Succeeded));

    let view = handle
        .wait_for(|v| v.artifact.is_some(), Duration::from_secs(10))
        .await
        .expect("artifact");
    let artifact = view.artifact.expect("artifact present");
    assert_eq!(artifact.prompt, "you said: hello");
    assert_eq!(
        *recorded.prompts.lock().unwrap(),
        vec!["you said: hello".to_string()]
    );

    assert!(handle.shutdown());
    task.await.expect("session task");
}

#[tokio::test]
async fn session_over_http_failure() {
    let (addr, recorded) = spawn_server().await;
    let config = SessionConfig {
        completion_url: format!("http://{addr}/api/fail"),
        image_url: format!("http://{addr}/api/get-image"),
        reveal_interval_ms: 1,
        ..Default::default()
    };
    let (handle, _events, task) = start_http_session(config).expect("valid config");

    handle.submit("hello").expect("submit");
    let view = handle
        .wait_for(settled, Duration::from_secs(10))
        .await
        .expect("turn finalized");
    assert_eq!(view.turns[0].bot, "Request failed.");
    assert_eq!(view.last_outcome, Some(LifecycleState::Failed));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(recorded.prompts.lock().unwrap().is_empty());

    assert!(handle.shutdown());
    task.await.expect("session task");
}

#[tokio::test]
async fn session_rejects_zero_reveal_interval() {
    let config = SessionConfig {
        reveal_interval_ms: 0,
        ..Default::default()
    };
    let err = start_http_session(config).expect_err("zero interval");
    assert!(err.to_string().contains("reveal_interval_ms"));
}
