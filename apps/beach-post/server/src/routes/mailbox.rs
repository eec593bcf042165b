use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use metrics::counter;
use serde::Deserialize;
use tracing::debug;

use super::{SEND_NO_USER, SEND_OK};
use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct ReceiveQuery {
    /// A missing id polls the empty user, which simply times out.
    #[serde(rename = "userId", default)]
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendQuery {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub msg: String,
    /// Set by peers relaying a fan-out; such sends are only looked up locally.
    #[serde(default)]
    pub forwarded: Option<String>,
}

impl SendQuery {
    fn is_forwarded(&self) -> bool {
        matches!(self.forwarded.as_deref(), Some("1") | Some("true"))
    }
}

/// Long poll. Answers with the next message for the user, or an empty body
/// once the poll timeout passes.
pub async fn receive(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<ReceiveQuery>,
) -> String {
    counter!("beach_post_polls_started_total", 1);
    let handle = state.sessions.connect(&query.user_id, &remote.to_string());

    match handle.wait(state.poll_timeout).await {
        Some(message) => {
            counter!("beach_post_polls_delivered_total", 1);
            message
        }
        None => {
            counter!("beach_post_polls_timed_out_total", 1);
            String::new()
        }
    }
}

pub async fn send(
    State(state): State<SharedState>,
    Query(query): Query<SendQuery>,
) -> &'static str {
    if state.sessions.deliver(&query.user_id, query.msg.as_str()) {
        return SEND_OK;
    }
    if query.is_forwarded() {
        return SEND_NO_USER;
    }

    debug!(user_id = %query.user_id, "user not connected here; forwarding to peers");
    if state.cluster.route(&query.user_id, &query.msg).await {
        SEND_OK
    } else {
        SEND_NO_USER
    }
}
