use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ClusterAgent, PeerRpc, PeerRpcError};
use crate::{membership::PeerDescriptor, session::SessionStore};

/// In-process cluster fabric for tests and single-binary demos.
///
/// Nodes attach under the address peers dial them at. Each node talks through
/// its own [`LocalPeerEndpoint`], which stamps calls with the node's source
/// host the way a TCP connection would.
#[derive(Clone, Default)]
pub struct LocalPeerNetwork {
    nodes: Arc<RwLock<HashMap<String, LocalNode>>>,
}

#[derive(Clone)]
struct LocalNode {
    agent: Weak<ClusterAgent>,
    sessions: SessionStore,
}

impl LocalPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for a node whose calls originate from `source`.
    pub fn endpoint(&self, source: IpAddr) -> Arc<LocalPeerEndpoint> {
        Arc::new(LocalPeerEndpoint {
            network: self.clone(),
            source,
        })
    }

    pub fn attach(
        &self,
        address: impl Into<String>,
        agent: &Arc<ClusterAgent>,
        sessions: SessionStore,
    ) {
        self.nodes.write().insert(
            address.into(),
            LocalNode {
                agent: Arc::downgrade(agent),
                sessions,
            },
        );
    }

    /// Makes `address` unreachable, as if the node went down.
    pub fn detach(&self, address: &str) {
        self.nodes.write().remove(address);
    }

    fn resolve(&self, address: &str) -> Result<(Arc<ClusterAgent>, SessionStore), PeerRpcError> {
        let nodes = self.nodes.read();
        let node = nodes
            .get(address)
            .ok_or_else(|| PeerRpcError::Transport(format!("connection refused: {address}")))?;
        let agent = node
            .agent
            .upgrade()
            .ok_or_else(|| PeerRpcError::Transport(format!("node at {address} shut down")))?;
        Ok((agent, node.sessions.clone()))
    }
}

pub struct LocalPeerEndpoint {
    network: LocalPeerNetwork,
    source: IpAddr,
}

#[async_trait]
impl PeerRpc for LocalPeerEndpoint {
    async fn handshake(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<PeerDescriptor, PeerRpcError> {
        let (agent, _) = self.network.resolve(address)?;
        agent
            .accept_handshake(local.clone(), self.source)
            .map_err(|_| PeerRpcError::Status(400))
    }

    async fn query_peers(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, PeerRpcError> {
        let (agent, _) = self.network.resolve(address)?;
        agent
            .accept_peer_query(local.clone(), self.source)
            .map_err(|_| PeerRpcError::Status(400))
    }

    async fn deliver(
        &self,
        address: &str,
        user_id: &str,
        message: &str,
    ) -> Result<bool, PeerRpcError> {
        let (_, sessions) = self.network.resolve(address)?;
        Ok(sessions.deliver(user_id, message))
    }
}
