//! Cluster membership and cross-node message routing.
//!
//! Every node keeps two [`MembershipTable`]s: `candidates`, addresses it has
//! heard of but not verified, and `confirmed`, peers that answered a
//! handshake. A background loop handshakes candidates, then asks confirmed
//! peers for their confirmed lists, so membership spreads transitively until
//! every reachable node knows every other one.
//!
//! Machine ids are trusted as given. Two live nodes configured with the same
//! id will shadow each other; keeping ids unique is an operator concern.

mod local;
mod rpc;

pub use local::{LocalPeerEndpoint, LocalPeerNetwork};
pub use rpc::{PeerRpc, PeerRpcError};

use std::{future::Future, net::IpAddr, str::FromStr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::membership::{AddressError, MembershipTable, PeerDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanoutMode {
    /// Try confirmed peers one at a time, stopping at the first that accepts.
    Sequential,
    /// Ask every confirmed peer at once; succeed if any accepts.
    #[default]
    Parallel,
}

impl FromStr for FanoutMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "sequential" => Ok(FanoutMode::Sequential),
            "parallel" => Ok(FanoutMode::Parallel),
            other => Err(format!(
                "unknown fan-out mode `{other}` (expected `sequential` or `parallel`)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Upper bound for any single call to a peer.
    pub rpc_timeout: Duration,
    /// Pause before the handshake phase of each cycle.
    pub handshake_delay: Duration,
    /// Pause between the handshake and query phases.
    pub query_delay: Duration,
    /// Pause after the query phase.
    pub idle_interval: Duration,
    pub fanout: FanoutMode,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(1),
            handshake_delay: Duration::from_secs(1),
            query_delay: Duration::from_secs(1),
            idle_interval: Duration::from_secs(30),
            fanout: FanoutMode::Parallel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub machine_id: String,
    /// Port this node serves peers on.
    pub port: u16,
    /// First address to handshake with, if any.
    pub seed: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeReport {
    pub promoted: usize,
    pub dropped_self: usize,
    pub failed: usize,
}

pub struct ClusterAgent {
    identity: NodeIdentity,
    candidates: MembershipTable,
    confirmed: MembershipTable,
    rpc: Arc<dyn PeerRpc>,
    config: ClusterConfig,
}

impl ClusterAgent {
    pub fn new(identity: NodeIdentity, config: ClusterConfig, rpc: Arc<dyn PeerRpc>) -> Self {
        let candidates = MembershipTable::new();
        if let Some(seed) = identity.seed.as_deref().filter(|seed| !seed.is_empty()) {
            candidates.add_seed(seed);
        }
        Self {
            identity,
            candidates,
            confirmed: MembershipTable::new(),
            rpc,
            config,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.identity.machine_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn candidates(&self) -> &MembershipTable {
        &self.candidates
    }

    pub fn confirmed(&self) -> &MembershipTable {
        &self.confirmed
    }

    /// Descriptor we present to peers. The host is a placeholder; receivers
    /// substitute the host they observed.
    pub fn local_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(
            format!("0.0.0.0:{}", self.identity.port),
            self.identity.machine_id.clone(),
        )
    }

    /// Queues `peer` for a handshake unless it is us or already confirmed.
    pub fn record_candidate(&self, peer: PeerDescriptor) -> bool {
        if peer.machine_id == self.identity.machine_id {
            return false;
        }
        if self.confirmed.contains(&peer.machine_id, &peer.remote_address) {
            return false;
        }
        let address = peer.remote_address.clone();
        let added = self.candidates.add_if_absent(peer);
        if added {
            debug!(peer = %address, "new cluster candidate");
            gauge!("beach_post_cluster_candidates", self.candidates.len() as f64);
        }
        added
    }

    /// Inbound handshake: remember the caller and answer with our descriptor.
    pub fn accept_handshake(
        &self,
        claimed: PeerDescriptor,
        observed: IpAddr,
    ) -> Result<PeerDescriptor, AddressError> {
        let caller = claimed.with_observed_host(observed)?;
        self.record_candidate(caller);
        Ok(self.local_descriptor())
    }

    /// Inbound peer-list query: remember the caller and answer with our
    /// confirmed list.
    pub fn accept_peer_query(
        &self,
        claimed: PeerDescriptor,
        observed: IpAddr,
    ) -> Result<Vec<PeerDescriptor>, AddressError> {
        let caller = claimed.with_observed_host(observed)?;
        self.record_candidate(caller);
        Ok(self.confirmed.snapshot())
    }

    /// Handshakes every candidate present when the pass starts. Candidates
    /// that fail stay put for the next pass.
    pub async fn handshake_candidates(&self) -> HandshakeReport {
        let local = self.local_descriptor();
        let mut report = HandshakeReport::default();

        for candidate in self.candidates.snapshot() {
            let address = candidate.remote_address.clone();
            let reply = match self.bounded(self.rpc.handshake(&address, &local)).await {
                Ok(reply) if reply.has_identity() => reply,
                Ok(_) => {
                    let err = PeerRpcError::Decode("reply carried no machine id".into());
                    self.note_rpc_failure("handshake", &address, &err);
                    report.failed += 1;
                    continue;
                }
                Err(err) => {
                    self.note_rpc_failure("handshake", &address, &err);
                    report.failed += 1;
                    continue;
                }
            };

            self.candidates.remove(&address);
            if reply.machine_id == self.identity.machine_id {
                debug!(peer = %address, "candidate is this node; dropping");
                report.dropped_self += 1;
                continue;
            }

            if candidate.machine_id != reply.machine_id && candidate.has_identity() {
                debug!(
                    peer = %address,
                    claimed = %candidate.machine_id,
                    reported = %reply.machine_id,
                    "candidate reported a different machine id"
                );
            }
            let member = PeerDescriptor::new(candidate.remote_address, reply.machine_id);
            let machine_id = member.machine_id.clone();
            if self.confirmed.add_if_absent(member) {
                info!(peer = %address, machine_id = %machine_id, "peer confirmed");
            }
            report.promoted += 1;
        }

        gauge!("beach_post_cluster_candidates", self.candidates.len() as f64);
        gauge!("beach_post_cluster_confirmed", self.confirmed.len() as f64);
        report
    }

    /// Asks every confirmed peer for its confirmed list and queues unknown
    /// members as candidates. Returns how many candidates were added.
    pub async fn exchange_peers(&self) -> usize {
        let local = self.local_descriptor();
        let mut discovered = 0;

        for member in self.confirmed.snapshot() {
            let address = member.remote_address.as_str();
            let peers = match self.bounded(self.rpc.query_peers(address, &local)).await {
                Ok(peers) => peers,
                Err(err) => {
                    self.note_rpc_failure("query_peers", address, &err);
                    continue;
                }
            };
            for peer in peers {
                if self.record_candidate(peer) {
                    discovered += 1;
                }
            }
        }

        discovered
    }

    /// One handshake pass followed by one exchange pass, without the pauses.
    pub async fn run_cycle(&self) -> HandshakeReport {
        let report = self.handshake_candidates().await;
        self.exchange_peers().await;
        report
    }

    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                machine_id = %agent.identity.machine_id,
                seed = ?agent.identity.seed,
                "cluster maintenance started"
            );
            loop {
                tokio::time::sleep(agent.config.handshake_delay).await;
                let report = agent.handshake_candidates().await;
                if report != HandshakeReport::default() {
                    debug!(
                        promoted = report.promoted,
                        dropped_self = report.dropped_self,
                        failed = report.failed,
                        "handshake pass finished"
                    );
                }
                tokio::time::sleep(agent.config.query_delay).await;
                let discovered = agent.exchange_peers().await;
                if discovered > 0 {
                    debug!(discovered, "peer exchange found new candidates");
                }
                tokio::time::sleep(agent.config.idle_interval).await;
            }
        })
    }

    /// Forwards `message` to the confirmed peers using the configured mode.
    pub async fn route(&self, user_id: &str, message: &str) -> bool {
        let delivered = match self.config.fanout {
            FanoutMode::Sequential => self.route_sequential(user_id, message).await,
            FanoutMode::Parallel => self.route_parallel(user_id, message).await,
        };
        counter!("beach_post_fanout_attempts_total", 1);
        if delivered {
            counter!("beach_post_fanout_delivered_total", 1);
        }
        delivered
    }

    pub async fn route_sequential(&self, user_id: &str, message: &str) -> bool {
        for peer in self.confirmed.snapshot() {
            if self.deliver_to(&peer, user_id, message).await {
                return true;
            }
        }
        false
    }

    pub async fn route_parallel(&self, user_id: &str, message: &str) -> bool {
        let attempts = self
            .confirmed
            .snapshot()
            .into_iter()
            .map(|peer| async move { self.deliver_to(&peer, user_id, message).await });
        join_all(attempts).await.into_iter().any(|accepted| accepted)
    }

    async fn deliver_to(&self, peer: &PeerDescriptor, user_id: &str, message: &str) -> bool {
        let address = peer.remote_address.as_str();
        match self
            .bounded(self.rpc.deliver(address, user_id, message))
            .await
        {
            Ok(accepted) => {
                if accepted {
                    debug!(peer = %address, user_id = %user_id, "peer accepted message");
                }
                accepted
            }
            Err(err) => {
                self.note_rpc_failure("deliver", address, &err);
                false
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, PeerRpcError>>,
    ) -> Result<T, PeerRpcError> {
        tokio::time::timeout(self.config.rpc_timeout, call)
            .await
            .unwrap_or(Err(PeerRpcError::Timeout))
    }

    fn note_rpc_failure(&self, op: &'static str, address: &str, err: &PeerRpcError) {
        debug!(op, peer = %address, error = %err, "peer call failed");
        counter!(
            "beach_post_peer_rpc_failures_total",
            1,
            "op" => op,
            "kind" => err.kind()
        );
    }
}

#[cfg(test)]
mod tests;
