//! Core of the Beach Post relay: long-poll mailboxes, session leases and the
//! cluster membership protocol. Nothing here touches HTTP; peers are reached
//! through the [`cluster::PeerRpc`] trait.

pub mod cluster;
pub mod handoff;
pub mod membership;
pub mod session;

pub use cluster::{
    ClusterAgent, ClusterConfig, FanoutMode, HandshakeReport, LocalPeerNetwork, NodeIdentity,
    PeerRpc, PeerRpcError,
};
pub use handoff::HandoffQueue;
pub use membership::{AddressError, MembershipTable, PeerDescriptor};
pub use session::{MailboxHandle, SessionConfig, SessionKey, SessionStore, SweepReport};
