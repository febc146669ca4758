//! HTTP handlers for the invocation protocol.
//!
//! External callers `POST /yafaas/events`; the worker long-polls
//! `GET /yafaas/events/next` and answers on `/yafaas/events/{id}/response`
//! or `/yafaas/events/{id}/error`. A client that disconnects drops its
//! handler future, which cancels the pending bus operation.

use axum::Router;
use axum::extract::rejection::{BytesRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{BusError, Delivery, EventBus};

/// Prefix shared by every protocol route.
pub const ROUTE_PREFIX: &str = "/yafaas";

/// Response header carrying the correlation id of a delivered event.
pub const EVENT_ID_HEADER: &str = "Event-Id";

/// Banner served on `GET /`.
pub const BANNER: &str = concat!("yafaas v", env!("CARGO_PKG_VERSION"), "\n");

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    pub bus: EventBus,
    /// Cancelled once shutdown begins; new submissions are refused while
    /// polls and results for events already accepted are still served.
    pub draining: CancellationToken,
    /// Cancelled when the shutdown grace period runs out; every pending bus
    /// operation is derived from it.
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            draining: CancellationToken::new(),
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Ack {
    message: &'static str,
}

const ACK: Ack = Ack { message: "Ok" };

/// Build the router with request tracing, request ids and panic recovery.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/events", post(submit_event))
        .route("/events/next", get(next_event))
        .route("/events/{id}/response", post(post_response))
        .route("/events/{id}/error", post(post_error))
        .route("/error", post(runtime_error));

    Router::new()
        .route("/", get(banner))
        .nest(ROUTE_PREFIX, api)
        .with_state(state)
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// `GET /`
async fn banner() -> &'static str {
    BANNER
}

/// `GET /yafaas/events/next`: Block until an event is submitted.
async fn next_event(State(state): State<AppState>) -> Response {
    debug!("Worker waiting for event");
    let cancel = state.cancel.child_token();
    match state.bus.await_next(&cancel).await {
        Ok(event) => {
            let id = event.id();
            info!(event_id = %id, "Sending event to worker");
            ([(EVENT_ID_HEADER, id.to_string())], event.into_payload()).into_response()
        }
        Err(e) => {
            debug!(error = %e, "Long poll ended without an event");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// `POST /yafaas/events`: Invoke the function and return its result.
async fn submit_event(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    if state.draining.is_cancelled() {
        info!("Refusing event, server is shutting down");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down").into_response();
    }
    let body = match body {
        Ok(body) => body,
        Err(e) => return read_failure(&e),
    };
    info!(bytes = body.len(), "Received event");

    let cancel = state.cancel.child_token();
    match state.bus.submit(body, &cancel).await {
        Ok(outcome) if outcome.is_ok() => {
            debug!(event_id = %outcome.id(), "Returning result to caller");
            (StatusCode::OK, outcome.into_payload()).into_response()
        }
        Ok(outcome) => {
            warn!(event_id = %outcome.id(), "Invocation failed in worker");
            (StatusCode::BAD_GATEWAY, outcome.into_payload()).into_response()
        }
        Err(e) => unavailable(e),
    }
}

/// `POST /yafaas/events/{id}/response`
async fn post_response(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    post_outcome(state, id, body, true).await
}

/// `POST /yafaas/events/{id}/error`
async fn post_error(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    post_outcome(state, id, body, false).await
}

async fn post_outcome(
    state: AppState,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Bytes, BytesRejection>,
    ok: bool,
) -> Response {
    let Path(id) = match id {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.body_text()).into_response(),
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => return read_failure(&e),
    };
    if ok {
        info!(event_id = %id, "Received response from event invocation");
    } else {
        warn!(event_id = %id, "Received error response from event invocation");
    }

    let cancel = state.cancel.child_token();
    match state.bus.post_result(id, body, ok, &cancel).await {
        Ok(Delivery::Delivered | Delivery::Discarded) => Json(ACK).into_response(),
        Err(e) => unavailable(e),
    }
}

/// `POST /yafaas/error`: The worker failed outside of any invocation.
async fn runtime_error(body: Result<Bytes, BytesRejection>) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(e) => return read_failure(&e),
    };
    error!(error = %String::from_utf8_lossy(&body), "Received error from worker runtime");
    Json(ACK).into_response()
}

fn read_failure(e: &BytesRejection) -> Response {
    warn!(error = %e, "Failed to read request body");
    (StatusCode::INTERNAL_SERVER_ERROR, e.body_text()).into_response()
}

fn unavailable(e: BusError) -> Response {
    debug!(error = %e, "Bus operation abandoned");
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}
