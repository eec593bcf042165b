use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A cluster node as seen on the wire. `machine_id` is empty for a peer known
/// only by address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerDescriptor {
    pub remote_address: String,
    #[serde(default)]
    pub machine_id: String,
}

impl PeerDescriptor {
    pub fn new(remote_address: impl Into<String>, machine_id: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            machine_id: machine_id.into(),
        }
    }

    pub fn address_only(remote_address: impl Into<String>) -> Self {
        Self::new(remote_address, String::new())
    }

    pub fn has_identity(&self) -> bool {
        !self.machine_id.is_empty()
    }

    /// Replaces the claimed host with the host the request actually came
    /// from, keeping the claimed port (the observed port is ephemeral).
    pub fn with_observed_host(mut self, observed: IpAddr) -> Result<Self, AddressError> {
        let port = claimed_port(&self.remote_address)?;
        self.remote_address = SocketAddr::new(observed, port).to_string();
        Ok(self)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address `{0}` has no port")]
    MissingPort(String),
    #[error("address `{0}` has an invalid port")]
    InvalidPort(String),
}

fn claimed_port(address: &str) -> Result<u16, AddressError> {
    let (_, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AddressError::MissingPort(address.to_string()))?;
    port.parse()
        .map_err(|_| AddressError::InvalidPort(address.to_string()))
}

/// Ordered, internally synchronized list of peers. An entry is unique by
/// address and by (non-empty) machine id.
#[derive(Debug, Default)]
pub struct MembershipTable {
    peers: RwLock<Vec<PeerDescriptor>>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a bare address unless that address is already listed.
    pub fn add_seed(&self, address: &str) -> bool {
        let mut peers = self.peers.write();
        if peers.iter().any(|peer| peer.remote_address == address) {
            return false;
        }
        peers.push(PeerDescriptor::address_only(address));
        true
    }

    /// Inserts `peer` unless its address or identity is already listed.
    pub fn add_if_absent(&self, peer: PeerDescriptor) -> bool {
        let mut peers = self.peers.write();
        if peers.iter().any(|known| collides(known, &peer.machine_id, &peer.remote_address)) {
            return false;
        }
        peers.push(peer);
        true
    }

    pub fn contains(&self, machine_id: &str, address: &str) -> bool {
        self.peers
            .read()
            .iter()
            .any(|known| collides(known, machine_id, address))
    }

    pub fn remove(&self, address: &str) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|peer| peer.remote_address != address);
        peers.len() != before
    }

    /// Independent copy of the current entries, safe to hold across network
    /// calls.
    pub fn snapshot(&self) -> Vec<PeerDescriptor> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

// Empty ids never match; otherwise every address-only entry would collide
// with every other one.
fn collides(known: &PeerDescriptor, machine_id: &str, address: &str) -> bool {
    known.remote_address == address
        || (!machine_id.is_empty() && known.machine_id == machine_id)
}
