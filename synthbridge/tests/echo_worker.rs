//! End-to-end tests against the `echo-worker` binary as a real child process.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use synthbridge::transport::http::routes;
use synthbridge::{
    Bootstrap, BootstrapMode, BridgeConfig, BridgeError, BridgeService, Message,
    RequestSerializer, RestartPolicy, SessionConfig, SessionState, WorkerSession,
};

const WITHIN: Duration = Duration::from_secs(10);

fn echo_worker() -> SessionConfig {
    SessionConfig::new(env!("CARGO_BIN_EXE_echo-worker"))
}

/// Spawn the bridge and wait until its eager bootstrap has settled either way.
async fn settled(session: SessionConfig, config: BridgeConfig) -> RequestSerializer {
    let bridge = RequestSerializer::spawn(WorkerSession::from_config(session), config);
    tokio::time::timeout(
        WITHIN,
        bridge
            .subscribe()
            .wait_for(|s| s.state.is_live() || s.state.is_stopped()),
    )
    .await
    .expect("bootstrap did not settle")
    .unwrap();
    bridge
}

fn app(bridge: RequestSerializer) -> Router {
    routes(Arc::new(BridgeService::new(Arc::new(bridge))))
}

async fn post_synthesize(app: Router, body: &'static str) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::post("/synthesize")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn synth(text: &str) -> Message {
    Message::command("synthesize").with("text", text)
}

#[tokio::test]
async fn synthesize_returns_worker_body_verbatim() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    let (status, body) = post_synthesize(app(bridge), r#"{"text":"hello","lang":"en"}"#).await;

    assert_eq!(status, StatusCode::OK);
    insta::assert_snapshot!(serde_json::to_string_pretty(&body).unwrap(), @r#"
    {
      "status": "success",
      "audio": "aGVsbG8=",
      "sample_rate": 44100,
      "echo": "hello"
    }
    "#);
}

#[tokio::test]
async fn worker_error_reply_is_passed_through() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    let (status, body) = post_synthesize(app(bridge), r#"{"text":""}"#).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"error": "Text is empty"}));
}

#[tokio::test]
async fn absent_worker_fails_requests_but_not_health() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("cpp/build/start_host.sh");
    let bridge = settled(SessionConfig::new(&missing), BridgeConfig::default()).await;
    assert_eq!(bridge.snapshot().state, SessionState::Failed);
    let app = app(bridge);

    let (status, body) = post_synthesize(app.clone(), r#"{"text":"hello"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error = body["error"].as_str().unwrap();
    assert!(error.contains(&missing.display().to_string()), "{error}");

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(
        serde_json::from_slice::<Value>(&bytes).unwrap(),
        json!({"status": "ok"})
    );
}

#[tokio::test]
async fn rejected_initialize_refuses_requests() {
    let bridge = settled(
        echo_worker().with_args(["--fail-init"]),
        BridgeConfig::default(),
    )
    .await;

    let err = bridge.submit(synth("hello")).await.unwrap_err();
    assert!(
        matches!(err, BridgeError::Initialize(ref m) if m == "initialization refused"),
        "got {err:?}"
    );

    let (status, _) = post_synthesize(app(bridge), r#"{"text":"hello"}"#).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn crash_mid_reply_fails_in_flight_and_later_requests() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    let err = tokio::time::timeout(WITHIN, bridge.submit(Message::command("crash")))
        .await
        .expect("crash exchange hung")
        .unwrap_err();
    assert!(matches!(err, BridgeError::WorkerDead(_)), "got {err:?}");

    let err = tokio::time::timeout(WITHIN, bridge.submit(synth("after")))
        .await
        .expect("request after crash hung")
        .unwrap_err();
    assert!(matches!(err, BridgeError::WorkerDead(_)), "got {err:?}");
    assert_eq!(bridge.snapshot().state, SessionState::Failed);
}

#[tokio::test]
async fn restart_on_failure_spawns_new_worker() {
    let config = BridgeConfig::default().with_restart(RestartPolicy::OnFailure);
    let bridge = settled(echo_worker(), config).await;
    let first_pid = bridge.snapshot().pid;

    assert!(bridge.submit(Message::command("crash")).await.is_err());

    let reply = bridge.submit(synth("again")).await.unwrap();
    assert_eq!(reply.get("echo"), Some(&json!("again")));
    assert_ne!(bridge.snapshot().pid, first_pid);
}

#[tokio::test]
async fn concurrent_callers_get_their_own_replies() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                let text = format!("request {i}");
                let reply = bridge.submit(synth(&text)).await.unwrap();
                assert_eq!(reply.get("echo"), Some(&json!(text)));
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(bridge.snapshot().exchanges, 20);
}

#[tokio::test]
async fn ping_passes_through() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    let reply = bridge.submit(Message::command("ping")).await.unwrap();
    assert_eq!(reply.get("status"), Some(&json!("pong")));
}

#[tokio::test]
async fn slow_reply_times_out_with_gateway_timeout() {
    let config = BridgeConfig::default().with_exchange_timeout(Duration::from_millis(200));
    let bridge = settled(echo_worker(), config).await;

    let (status, body) =
        post_synthesize(app(bridge), r#"{"command":"sleep","ms":5000}"#).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert!(body["error"].as_str().unwrap().contains("did not answer"));
}

#[tokio::test]
async fn lazy_bridge_starts_worker_on_first_request() {
    let config =
        BridgeConfig::default().with_bootstrap(Bootstrap::new().with_mode(BootstrapMode::Lazy));
    let bridge = RequestSerializer::spawn(WorkerSession::from_config(echo_worker()), config);
    assert_eq!(bridge.snapshot().state, SessionState::NotStarted);

    let reply = bridge.submit(synth("wake up")).await.unwrap();
    assert_eq!(reply.get("status"), Some(&json!("success")));

    let snapshot = bridge.snapshot();
    assert_eq!(snapshot.state, SessionState::Ready);
    assert!(snapshot.pid.is_some());
    assert_eq!(snapshot.exchanges, 1);
}

#[tokio::test]
async fn shutdown_terminates_worker() {
    let bridge = settled(echo_worker(), BridgeConfig::default()).await;

    tokio::time::timeout(WITHIN, bridge.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(bridge.snapshot().state, SessionState::Terminated);
    assert!(matches!(
        bridge.submit(synth("late")).await,
        Err(BridgeError::ShuttingDown)
    ));
}
