use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, State},
    Json,
};
use beach_post_core::PeerDescriptor;
use tracing::debug;

use super::ApiResult;
use crate::state::SharedState;

/// Peer handshake: records the caller under the host it connected from and
/// answers with this node's descriptor.
pub async fn handshake(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(claimed): Json<PeerDescriptor>,
) -> ApiResult<PeerDescriptor> {
    debug!(peer = %remote, machine_id = %claimed.machine_id, "handshake received");
    let local = state.cluster.accept_handshake(claimed, remote.ip())?;
    Ok(Json(local))
}

/// Peer-list exchange: records the caller and answers with our confirmed
/// members.
pub async fn query_members(
    State(state): State<SharedState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(claimed): Json<PeerDescriptor>,
) -> ApiResult<Vec<PeerDescriptor>> {
    let members = state.cluster.accept_peer_query(claimed, remote.ip())?;
    Ok(Json(members))
}

/// Operator view of the confirmed members.
pub async fn list_members(State(state): State<SharedState>) -> Json<Vec<PeerDescriptor>> {
    Json(state.cluster.confirmed().snapshot())
}
