//! HTTP front end of a Beach Post node: long-poll and send endpoints for
//! clients, and the `/_cluster` endpoints peers use to find each other.

pub mod config;
pub mod peer_client;
pub mod routes;
pub mod state;
pub mod telemetry;

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use beach_post_core::{ClusterAgent, NodeIdentity, SessionStore};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal, task::JoinHandle};
use tracing::info;

use crate::{
    config::NodeConfig,
    peer_client::HttpPeerRpc,
    state::{AppState, SharedState},
};

/// Shared state plus the background loops serving it.
pub struct RunningNode {
    pub state: SharedState,
    background: Vec<JoinHandle<()>>,
}

impl RunningNode {
    /// Builds the node's services for `port` (the port peers reach us on) and
    /// starts the session sweeper and cluster maintenance loops.
    pub fn start(config: &NodeConfig, port: u16, metrics: PrometheusHandle) -> Result<Self> {
        let rpc = HttpPeerRpc::new(config.cluster.rpc_timeout)?;
        let identity = NodeIdentity {
            machine_id: config.machine_id.clone(),
            port,
            seed: config.seed.clone(),
        };
        let cluster = Arc::new(ClusterAgent::new(
            identity,
            config.cluster.clone(),
            Arc::new(rpc),
        ));
        let sessions = SessionStore::new(config.session.clone());

        let background = vec![sessions.spawn_sweeper(), cluster.spawn_maintenance()];
        let state = Arc::new(AppState::new(
            sessions,
            cluster,
            config.poll_timeout,
            metrics,
        ));

        Ok(Self { state, background })
    }

    pub fn shutdown(self) {
        for task in self.background {
            task.abort();
        }
    }
}

/// Serves `state` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = routes::build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn run(config: NodeConfig, metrics: PrometheusHandle) -> Result<()> {
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let local_addr = listener.local_addr().context("listener has no local address")?;
    let node = RunningNode::start(&config, local_addr.port(), metrics)?;

    info!(
        listen_addr = %local_addr,
        machine_id = %config.machine_id,
        "beach-post listening"
    );
    let served = serve(listener, node.state.clone(), shutdown_signal()).await;

    info!("shutdown signal received; stopping background loops");
    node.shutdown();
    served
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
