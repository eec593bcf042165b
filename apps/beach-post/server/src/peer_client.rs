use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use beach_post_core::{PeerDescriptor, PeerRpc, PeerRpcError};
use serde::de::DeserializeOwned;

use crate::routes::{CLUSTER_HANDSHAKE_PATH, CLUSTER_QUERY_PATH, SEND_OK, SEND_PATH};

/// [`PeerRpc`] over plain HTTP/JSON against other beach-post nodes.
#[derive(Clone)]
pub struct HttpPeerRpc {
    client: reqwest::Client,
}

impl HttpPeerRpc {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("failed to build peer HTTP client")?;
        Ok(Self { client })
    }

    async fn post_descriptor<T: DeserializeOwned>(
        &self,
        address: &str,
        path: &str,
        local: &PeerDescriptor,
    ) -> Result<T, PeerRpcError> {
        let response = self
            .client
            .post(format!("http://{address}{path}"))
            .json(local)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PeerRpcError::Status(status.as_u16()));
        }
        let body = response.bytes().await.map_err(classify)?;
        serde_json::from_slice(&body).map_err(|err| PeerRpcError::Decode(err.to_string()))
    }
}

fn classify(err: reqwest::Error) -> PeerRpcError {
    if err.is_timeout() {
        PeerRpcError::Timeout
    } else if err.is_decode() {
        PeerRpcError::Decode(err.to_string())
    } else {
        PeerRpcError::Transport(err.to_string())
    }
}

#[async_trait]
impl PeerRpc for HttpPeerRpc {
    async fn handshake(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<PeerDescriptor, PeerRpcError> {
        self.post_descriptor(address, CLUSTER_HANDSHAKE_PATH, local)
            .await
    }

    async fn query_peers(
        &self,
        address: &str,
        local: &PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, PeerRpcError> {
        self.post_descriptor(address, CLUSTER_QUERY_PATH, local)
            .await
    }

    async fn deliver(
        &self,
        address: &str,
        user_id: &str,
        message: &str,
    ) -> Result<bool, PeerRpcError> {
        let response = self
            .client
            .get(format!("http://{address}{SEND_PATH}"))
            .query(&[("userId", user_id), ("msg", message), ("forwarded", "1")])
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PeerRpcError::Status(status.as_u16()));
        }
        let body = response.text().await.map_err(classify)?;
        Ok(body.trim() == SEND_OK)
    }
}
