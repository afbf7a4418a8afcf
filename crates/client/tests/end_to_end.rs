//! End-to-end tests against a scripted HTTP server: the server replays a
//! canned NDJSON event stream and records control-channel requests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use groundstation_client::{ClientConfig, ClientState, ConnectionStatus, SessionClient};

#[derive(Clone, Default)]
struct ServerLog {
    runs: Arc<Mutex<Vec<Value>>>,
    interrupts: Arc<Mutex<Vec<Value>>>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn script(lines: &[Value]) -> String {
    lines
        .iter()
        .map(|line| line.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn events_route<S>(body: String) -> axum::routing::MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    get(move || {
        let body = body.clone();
        async move { body }
    })
}

async fn wait_for(client: &SessionClient, predicate: impl Fn(&ClientState) -> bool) {
    let mut changes = client.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if predicate(&client.state()) {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    })
    .await
    .expect("state condition not reached in time");
    assert!(predicate(&client.state()));
}

#[tokio::test]
async fn replays_scripted_stream_into_state() {
    init_tracing();
    let body = script(&[
        json!({"type": "RUN_STARTED", "threadId": "t1", "runId": "r1"}),
        json!({"type": "STEP_STARTED", "stepName": "respond"}),
        json!({"type": "TEXT_MESSAGE_START", "messageId": "m1", "role": "assistant"}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "m1", "delta": "Hello"}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "m1", "delta": " world"}),
        json!({"type": "TEXT_MESSAGE_END", "messageId": "m1"}),
        json!({"type": "TOOL_CALL_START", "toolCallId": "tc1", "toolCallName": "bash"}),
        json!({"type": "TOOL_CALL_ARGS", "toolCallId": "tc1", "delta": "{\"cmd\":\"ls\"}"}),
        json!({"type": "TOOL_CALL_END", "toolCallId": "tc1", "result": "ok"}),
        json!({"type": "UNKNOWN_EVENT_KIND", "whatever": true}),
        json!({"type": "STATE_DELTA", "delta": [
            {"op": "add", "path": "/phase", "value": "done"}
        ]}),
        json!({"type": "STEP_FINISHED", "stepName": "respond"}),
        json!({"type": "RUN_FINISHED", "runId": "r1"}),
    ]) + "\nthis line is not json\n";

    let app = Router::new().route("/threads/t1/events", events_route(body));
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));
    client.connect(None).await;
    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Completed
    })
    .await;

    let state = client.state();
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "Hello world");
    assert_eq!(state.messages[0].tool_calls.len(), 1);
    assert_eq!(state.messages[0].tool_calls[0].name, "bash");
    assert_eq!(
        state.messages[0].tool_calls[0].result.as_deref(),
        Some("ok")
    );
    assert_eq!(state.kv_state["phase"], json!("done"));
    assert!(!state.kv_state.contains_key("currentStep"));
    assert!(state.active_run_id.is_none());
}

#[tokio::test]
async fn send_message_starts_run_and_subscribes() {
    init_tracing();
    let log = ServerLog::default();
    let body = script(&[
        json!({"type": "RUN_STARTED", "threadId": "t1", "runId": "run-42"}),
        json!({"type": "TEXT_MESSAGE_START", "messageId": "m1", "role": "assistant"}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "m1", "delta": "done"}),
        json!({"type": "TEXT_MESSAGE_END", "messageId": "m1"}),
        json!({"type": "RUN_FINISHED", "runId": "run-42"}),
    ]);

    async fn start_run(State(log): State<ServerLog>, Json(body): Json<Value>) -> Json<Value> {
        log.runs.lock().await.push(body);
        Json(json!({"runId": "run-42"}))
    }

    let app = Router::new()
        .route("/threads/t1/events", events_route(body))
        .route("/threads/t1/run", post(start_run))
        .with_state(log.clone());
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));
    let run_id = client.send_message("list the files").await.expect("run");
    assert_eq!(run_id, "run-42");

    let runs = log.runs.lock().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["threadId"], "t1");
    assert_eq!(runs[0]["messages"][0]["role"], "user");
    assert_eq!(runs[0]["messages"][0]["content"], "list the files");
    drop(runs);

    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Completed
    })
    .await;
    let state = client.state();
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "done");
    assert!(state.active_run_id.is_none());
}

#[tokio::test]
async fn interrupt_is_noop_without_active_run_and_two_phase_with_one() {
    init_tracing();
    let log = ServerLog::default();

    async fn start_run(State(log): State<ServerLog>, Json(body): Json<Value>) -> Json<Value> {
        log.runs.lock().await.push(body);
        Json(json!({"runId": "run-7"}))
    }

    async fn record_interrupt(
        State(log): State<ServerLog>,
        Json(body): Json<Value>,
    ) -> StatusCode {
        log.interrupts.lock().await.push(body);
        StatusCode::OK
    }

    let app = Router::new()
        // empty stream: connect succeeds, no events arrive
        .route("/threads/t1/events", events_route(String::new()))
        .route("/threads/t1/run", post(start_run))
        .route("/threads/t1/interrupt", post(record_interrupt))
        .with_state(log.clone());
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));

    // no active run: nothing to do, no request sent
    client.interrupt().await.expect("noop interrupt");
    assert!(log.interrupts.lock().await.is_empty());

    let run_id = client.send_message("long task").await.expect("run");
    assert_eq!(client.state().active_run_id.as_deref(), Some(run_id.as_str()));

    client.interrupt().await.expect("interrupt");
    let interrupts = log.interrupts.lock().await;
    assert_eq!(interrupts.len(), 1);
    assert_eq!(interrupts[0]["runId"], "run-7");
    drop(interrupts);

    let state = client.state();
    assert!(state.interrupt_requested);
    assert!(state.active_run_id.is_none());

    // a second interrupt has no run left to target
    client.interrupt().await.expect("second interrupt");
    assert_eq!(log.interrupts.lock().await.len(), 1);
}

#[tokio::test]
async fn interrupt_failure_surfaces_in_state() {
    init_tracing();

    async fn start_run(Json(_body): Json<Value>) -> Json<Value> {
        Json(json!({"runId": "run-9"}))
    }

    async fn reject_interrupt(Json(_body): Json<Value>) -> (StatusCode, String) {
        (StatusCode::INTERNAL_SERVER_ERROR, "denied".to_string())
    }

    let app = Router::new()
        .route("/threads/t1/events", events_route(String::new()))
        .route("/threads/t1/run", post(start_run))
        .route("/threads/t1/interrupt", post(reject_interrupt));
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));
    client.send_message("long task").await.expect("run");
    // let the empty stream finish so no later status change races the assert
    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Completed
    })
    .await;

    let error = client.interrupt().await.expect_err("rejected interrupt");
    assert!(error.to_string().contains("500"));

    let state = client.state();
    assert_eq!(state.connection_status, ConnectionStatus::Error);
    assert!(state
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("interrupt"));
    // the run was never marked inactive
    assert_eq!(state.active_run_id.as_deref(), Some("run-9"));
}

#[tokio::test]
async fn send_message_marks_connecting_while_request_is_in_flight() {
    init_tracing();

    async fn slow_run(Json(_body): Json<Value>) -> Json<Value> {
        tokio::time::sleep(Duration::from_millis(250)).await;
        Json(json!({"runId": "run-1"}))
    }

    let app = Router::new()
        .route("/threads/t1/events", events_route(String::new()))
        .route("/threads/t1/run", post(slow_run));
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));
    let worker = tokio::spawn({
        let client = client.clone();
        async move { client.send_message("hi").await }
    });
    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Connecting
    })
    .await;
    let run_id = worker.await.expect("join").expect("run accepted");
    assert_eq!(run_id, "run-1");
}

#[tokio::test]
async fn reconnects_after_stream_failure() {
    init_tracing();
    let attempts = Arc::new(AtomicUsize::new(0));
    let body = script(&[
        json!({"type": "RUN_STARTED", "threadId": "t1", "runId": "r1"}),
        json!({"type": "RUN_FINISHED", "runId": "r1"}),
    ]);

    let handler_attempts = Arc::clone(&attempts);
    let events = get(move || {
        let attempts = Arc::clone(&handler_attempts);
        let body = body.clone();
        async move {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string())
            } else {
                (StatusCode::OK, body)
            }
        }
    });

    let app = Router::new().route("/threads/t1/events", events);
    let base_url = serve(app).await;

    let mut config = ClientConfig::new(base_url, "t1");
    config.reconnect_delay = Duration::from_millis(100);
    let client = SessionClient::new(config);
    client.connect(None).await;

    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Completed
    })
    .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(client.state().last_error.is_none());
}

#[tokio::test]
async fn disconnect_keeps_history_and_clears_live_state() {
    init_tracing();
    let body = script(&[
        json!({"type": "RUN_STARTED", "threadId": "t1", "runId": "r1"}),
        json!({"type": "TEXT_MESSAGE_START", "messageId": "m1", "role": "assistant"}),
        json!({"type": "TEXT_MESSAGE_CONTENT", "messageId": "m1", "delta": "kept"}),
    ]);
    let app = Router::new().route("/threads/t1/events", events_route(body));
    let base_url = serve(app).await;

    let client = SessionClient::new(ClientConfig::new(base_url, "t1"));
    client.connect(None).await;
    // stream ends without a text end; the open message flushes on EOF
    wait_for(&client, |state| {
        state.connection_status == ConnectionStatus::Completed
    })
    .await;
    assert_eq!(client.state().messages.len(), 1);

    client.disconnect().await;
    let state = client.state();
    assert_eq!(state.connection_status, ConnectionStatus::Idle);
    assert!(state.in_progress.is_none());
    assert!(state.active_run_id.is_none());
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.messages[0].content, "kept");
}
