mod cluster;
mod mailbox;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beach_post_core::{AddressError, PeerDescriptor};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::SharedState;

pub use cluster::{handshake, list_members, query_members};
pub use mailbox::{receive, send, ReceiveQuery, SendQuery};

pub const RECEIVE_PATH: &str = "/receive";
pub const SEND_PATH: &str = "/send";
pub const CLUSTER_HANDSHAKE_PATH: &str = "/_cluster/initial";
pub const CLUSTER_QUERY_PATH: &str = "/_cluster/queryMachine";
pub const MEMBERS_PATH: &str = "/queryMachine";

pub const SEND_OK: &str = "ok";
pub const SEND_NO_USER: &str = "no user";

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route(RECEIVE_PATH, get(receive))
        .route(SEND_PATH, get(send))
        .route(CLUSTER_HANDSHAKE_PATH, post(handshake))
        .route(CLUSTER_QUERY_PATH, post(query_members))
        .route(MEMBERS_PATH, get(list_members))
        .route("/healthz", get(health_check))
        .route("/debug/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    machine_id: String,
    active_mailboxes: usize,
    mailboxes: Vec<MailboxStatsEntry>,
    candidates: Vec<PeerDescriptor>,
    confirmed: Vec<PeerDescriptor>,
}

#[derive(Debug, Serialize)]
struct MailboxStatsEntry {
    user_id: String,
    sessions: usize,
    pending_messages: usize,
}

async fn stats(State(state): State<SharedState>) -> impl IntoResponse {
    let mailboxes: Vec<MailboxStatsEntry> = state
        .sessions
        .snapshot()
        .into_iter()
        .map(|mailbox| MailboxStatsEntry {
            user_id: mailbox.user_id,
            sessions: mailbox.sessions,
            pending_messages: mailbox.pending_messages,
        })
        .collect();

    Json(StatsResponse {
        machine_id: state.cluster.machine_id().to_string(),
        active_mailboxes: mailboxes.len(),
        mailboxes,
        candidates: state.cluster.candidates().snapshot(),
        confirmed: state.cluster.confirmed().snapshot(),
    })
}

async fn metrics(State(state): State<SharedState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl From<AddressError> for ApiError {
    fn from(err: AddressError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
        }
    }
}
