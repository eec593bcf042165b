use async_trait::async_trait;
use thiserror::Error;

use crate::membership::PeerDescriptor;

#[derive(Debug, Error)]
pub enum PeerRpcError {
    #[error("peer did not answer in time")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("peer answered with status {0}")]
    Status(u16),
    #[error("malformed peer response: {0}")]
    Decode(String),
}

impl PeerRpcError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRpcError::Timeout => "timeout",
            PeerRpcError::Transport(_) => "transport",
            PeerRpcError::Status(_) => "status",
            PeerRpcError::Decode(_) => "decode",
        }
    }
}

/// Calls one node makes against another. Every call is addressed by the
/// peer's `host:port`.
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Sends our descriptor and returns the peer's own descriptor.
    async fn handshake(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<PeerDescriptor, PeerRpcError>;

    /// Sends our descriptor and returns the peer's confirmed members.
    async fn query_peers(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, PeerRpcError>;

    /// Asks the peer to deliver `message` to a locally connected `user_id`.
    /// `Ok(false)` means the peer answered but does not have the user.
    async fn deliver(
        &self,
        address: &str,
        user_id: &str,
        message: &str,
    ) -> Result<bool, PeerRpcError>;
}
