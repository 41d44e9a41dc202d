// HTTP API routes for the presentation layer (status, agents, invites, metrics).

pub mod ws;

use axum::{
    extract::{Json, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;

use crate::agent::controller::LifecycleState;
use crate::agent::identity::Roster;
use crate::error::InviteError;
use crate::invite::InviteService;
use crate::metrics;
use crate::presentation::PresentationSink;

// ── Request types ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct InviteBody {
    /// Profile name or label, e.g. "RandAgent" or "Random Player".
    #[serde(default)]
    pub agent: String,
    /// Showdown username to challenge.
    #[serde(default)]
    pub username: String,
}

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub sink: PresentationSink,
    pub lifecycle: watch::Receiver<LifecycleState>,
    pub roster: Roster,
    pub invites: InviteService,
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> impl IntoResponse {
    (status, Json(json!({ "error": msg })))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // Lifecycle status
        .route("/api/status", get(current_status))
        .route("/api/status/refresh", post(refresh_status))
        // Agents
        .route("/api/agents", get(list_agents))
        // Invites
        .route("/api/invite", post(submit_invite))
        .route("/api/invite/status", get(invite_status))
        // Metrics
        .route("/metrics", get(metrics_text))
        // WebSocket
        .route("/ws/status", get(ws::ws_status))
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "showdown-host" }))
}

// ── Status handlers ───────────────────────────────────────────────────

async fn current_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.sink.current_snapshot();
    let lifecycle = *state.lifecycle.borrow();
    (
        StatusCode::OK,
        Json(json!({
            "instruction": snapshot.instruction,
            "state": lifecycle,
            "revision": snapshot.revision,
            "updated_at": snapshot.updated_at,
        })),
    )
}

async fn refresh_status(State(state): State<AppState>) -> impl IntoResponse {
    state.sink.request_refresh();
    (StatusCode::ACCEPTED, Json(json!({ "status": "refresh requested" })))
}

// ── Agent handlers ────────────────────────────────────────────────────

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(state.roster.describe())))
}

// ── Invite handlers ───────────────────────────────────────────────────

async fn submit_invite(
    State(state): State<AppState>,
    Json(body): Json<InviteBody>,
) -> impl IntoResponse {
    match state.invites.submit(&body.agent, &body.username) {
        Ok(message) => {
            (StatusCode::ACCEPTED, Json(json!({ "message": message }))).into_response()
        }
        Err(e @ InviteError::RateLimited(_)) => {
            json_error(StatusCode::TOO_MANY_REQUESTS, &e.to_string()).into_response()
        }
        Err(e) => json_error(StatusCode::BAD_REQUEST, &e.to_string()).into_response(),
    }
}

async fn invite_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!(state.invites.status())))
}

// ── Metrics ───────────────────────────────────────────────────────────

async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}
