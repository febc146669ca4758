#![allow(clippy::unwrap_used, clippy::expect_used)] // Integration tests use unwrap for brevity

//! Integration tests for the HTTP invocation protocol.
//!
//! Drives the router in-process: one task plays the external caller, the
//! test body plays the worker's long-poll loop. Dropping a request future
//! (via `timeout`) is how a client disconnect looks to a handler.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio::task::JoinHandle;
use tower::ServiceExt;
use uuid::Uuid;

use yafaas_server::bus::EventBus;
use yafaas_server::server::{AppState, BANNER, EVENT_ID_HEADER, build_router};

const SHORT: Duration = Duration::from_millis(100);

fn app_with_bus() -> (axum::Router, EventBus) {
    let bus = EventBus::new();
    (build_router(AppState::new(bus.clone())), bus)
}

struct Reply {
    status: StatusCode,
    event_id: Option<String>,
    request_id: Option<String>,
    body: String,
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: &str) -> Reply {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(request).await.unwrap();
    let (status, event_id, request_id) = {
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .map(|v| v.to_str().unwrap().to_string())
        };
        (resp.status(), header(EVENT_ID_HEADER), header("x-request-id"))
    };
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    Reply {
        status,
        event_id,
        request_id,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

/// Submit a payload from a separate "caller" task.
fn submit(app: &axum::Router, payload: &'static str) -> JoinHandle<Reply> {
    let app = app.clone();
    tokio::spawn(async move { send(&app, "POST", "/yafaas/events", payload).await })
}

async fn poll(app: &axum::Router) -> Reply {
    tokio::time::timeout(Duration::from_secs(2), send(app, "GET", "/yafaas/events/next", ""))
        .await
        .expect("worker poll timed out")
}

async fn answer(app: &axum::Router, id: &str, kind: &str, body: &str) -> Reply {
    send(app, "POST", &format!("/yafaas/events/{id}/{kind}"), body).await
}

#[tokio::test]
async fn root_returns_banner() {
    let (app, _) = app_with_bus();
    let reply = send(&app, "GET", "/", "").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, BANNER);
    assert!(reply.body.starts_with("yafaas v"));
    assert!(reply.request_id.is_some(), "request id should be propagated");
}

#[tokio::test]
async fn ping_pong_round_trip() {
    let (app, _) = app_with_bus();
    let caller = submit(&app, "ping");

    let event = poll(&app).await;
    assert_eq!(event.status, StatusCode::OK);
    assert_eq!(event.body, "ping");
    let id = event.event_id.expect("Event-Id header");
    Uuid::parse_str(&id).expect("Event-Id is a uuid");

    let ack = answer(&app, &id, "response", "pong").await;
    assert_eq!(ack.status, StatusCode::OK);
    let ack: serde_json::Value = serde_json::from_str(&ack.body).unwrap();
    assert_eq!(ack, serde_json::json!({"message": "Ok"}));

    let result = caller.await.unwrap();
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body, "pong");
}

#[tokio::test]
async fn worker_error_unblocks_caller() {
    let (app, _) = app_with_bus();
    let caller = submit(&app, "ping");

    let event = poll(&app).await;
    let id = event.event_id.unwrap();
    let ack = answer(&app, &id, "error", r#"{"errorMessage":"boom"}"#).await;
    assert_eq!(ack.status, StatusCode::OK);

    let result = tokio::time::timeout(Duration::from_secs(2), caller)
        .await
        .expect("caller must not hang after a worker error")
        .unwrap();
    assert_eq!(result.status, StatusCode::BAD_GATEWAY);
    assert_eq!(result.body, r#"{"errorMessage":"boom"}"#);
}

#[tokio::test]
async fn second_submission_waits_for_first_round_trip() {
    let (app, _) = app_with_bus();
    let first = submit(&app, "first");
    let event = poll(&app).await;
    assert_eq!(event.body, "first");

    let second = submit(&app, "second");

    // While the first round trip is open the worker sees nothing new.
    let early = tokio::time::timeout(SHORT, send(&app, "GET", "/yafaas/events/next", "")).await;
    assert!(early.is_err(), "second event dispatched before first completed");
    assert!(!second.is_finished());

    answer(&app, &event.event_id.unwrap(), "response", "r1").await;
    assert_eq!(first.await.unwrap().body, "r1");

    let event = poll(&app).await;
    assert_eq!(event.body, "second");
    answer(&app, &event.event_id.unwrap(), "response", "r2").await;
    assert_eq!(second.await.unwrap().body, "r2");
}

#[tokio::test]
async fn abandoned_poll_does_not_swallow_next_event() {
    let (app, _) = app_with_bus();

    let gone = tokio::time::timeout(SHORT, send(&app, "GET", "/yafaas/events/next", "")).await;
    assert!(gone.is_err());

    let caller = submit(&app, "later");
    let event = poll(&app).await;
    assert_eq!(event.body, "later");
    answer(&app, &event.event_id.unwrap(), "response", "done").await;
    assert_eq!(caller.await.unwrap().body, "done");
}

#[tokio::test]
async fn disconnected_caller_does_not_receive_next_result() {
    let (app, bus) = app_with_bus();

    // The caller gives up after the worker took its event.
    let abandoned = tokio::spawn({
        let app = app.clone();
        async move {
            tokio::time::timeout(
                Duration::from_millis(200),
                send(&app, "POST", "/yafaas/events", "old"),
            )
            .await
        }
    });
    let old = poll(&app).await;
    assert!(abandoned.await.unwrap().is_err());

    let ack = tokio::time::timeout(
        Duration::from_secs(2),
        answer(&app, &old.event_id.unwrap(), "response", "stale"),
    )
    .await
    .expect("late response must not wedge the worker");
    assert_eq!(ack.status, StatusCode::OK);

    let caller = submit(&app, "new");
    let event = poll(&app).await;
    assert_eq!(event.body, "new");
    answer(&app, &event.event_id.unwrap(), "response", "fresh").await;
    assert_eq!(caller.await.unwrap().body, "fresh");
    assert_eq!(bus.in_flight(), None);
}

#[tokio::test]
async fn second_result_for_same_event_is_acknowledged() {
    let (app, _) = app_with_bus();
    let caller = submit(&app, "ping");
    let event = poll(&app).await;
    let id = event.event_id.unwrap();

    answer(&app, &id, "response", "pong").await;
    let again = tokio::time::timeout(Duration::from_secs(2), answer(&app, &id, "error", "late"))
        .await
        .expect("duplicate result must not hang the worker");
    assert_eq!(again.status, StatusCode::OK);

    let result = caller.await.unwrap();
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body, "pong");
}

#[tokio::test]
async fn draining_refuses_new_events_but_accepts_results() {
    let bus = EventBus::new();
    let state = AppState::new(bus.clone());
    let draining = state.draining.clone();
    let app = build_router(state);

    let caller = submit(&app, "accepted");
    let event = poll(&app).await;
    draining.cancel();

    let refused = send(&app, "POST", "/yafaas/events", "refused").await;
    assert_eq!(refused.status, StatusCode::SERVICE_UNAVAILABLE);

    answer(&app, &event.event_id.unwrap(), "response", "done").await;
    let result = caller.await.unwrap();
    assert_eq!(result.status, StatusCode::OK);
    assert_eq!(result.body, "done");
}

#[tokio::test]
async fn response_for_unknown_event_is_acknowledged() {
    let (app, _) = app_with_bus();
    let id = Uuid::new_v4();
    let reply = tokio::time::timeout(SHORT, answer(&app, &id.to_string(), "response", "x"))
        .await
        .unwrap();
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_event_id_is_rejected() {
    let (app, _) = app_with_bus();
    let reply = answer(&app, "not-a-uuid", "error", "x").await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn runtime_error_is_acknowledged() {
    let (app, _) = app_with_bus();
    let reply = send(&app, "POST", "/yafaas/error", r#"{"errorType":"Init"}"#).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(reply.body.contains("Ok"));
}

#[tokio::test]
async fn closed_bus_turns_callers_away() {
    let (app, bus) = app_with_bus();
    bus.close();

    let reply = send(&app, "POST", "/yafaas/events", "ping").await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    let reply = send(&app, "GET", "/yafaas/events/next", "").await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (app, _) = app_with_bus();
    let reply = send(&app, "GET", "/yafaas/functions", "").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}
