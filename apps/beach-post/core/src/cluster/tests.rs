use super::*;
use crate::session::SessionStore;

use std::time::Instant;

struct TestNode {
    address: String,
    agent: Arc<ClusterAgent>,
    sessions: SessionStore,
}

impl TestNode {
    fn confirmed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agent
            .confirmed()
            .snapshot()
            .into_iter()
            .map(|peer| peer.machine_id)
            .collect();
        ids.sort();
        ids
    }
}

fn quick_config() -> ClusterConfig {
    ClusterConfig {
        rpc_timeout: Duration::from_millis(100),
        handshake_delay: Duration::from_millis(5),
        query_delay: Duration::from_millis(5),
        idle_interval: Duration::from_millis(10),
        fanout: FanoutMode::Parallel,
    }
}

fn spawn_node(
    network: &LocalPeerNetwork,
    host: &str,
    port: u16,
    machine_id: &str,
    seed: Option<&str>,
) -> TestNode {
    let source: IpAddr = host.parse().unwrap();
    let identity = NodeIdentity {
        machine_id: machine_id.to_string(),
        port,
        seed: seed.map(str::to_string),
    };
    let agent = Arc::new(ClusterAgent::new(
        identity,
        quick_config(),
        network.endpoint(source),
    ));
    let sessions = SessionStore::default();
    let address = format!("{host}:{port}");
    network.attach(address.clone(), &agent, sessions.clone());
    TestNode {
        address,
        agent,
        sessions,
    }
}

async fn run_rounds(nodes: &[&TestNode], rounds: usize) {
    for _ in 0..rounds {
        for node in nodes {
            node.agent.run_cycle().await;
        }
    }
}

struct StalledRpc;

#[async_trait::async_trait]
impl PeerRpc for StalledRpc {
    async fn handshake(
        &self,
        _address: &str,
        _local: &PeerDescriptor,
    ) -> Result<PeerDescriptor, PeerRpcError> {
        std::future::pending().await
    }

    async fn query_peers(
        &self,
        _address: &str,
        _local: &PeerDescriptor,
    ) -> Result<Vec<PeerDescriptor>, PeerRpcError> {
        std::future::pending().await
    }

    async fn deliver(
        &self,
        _address: &str,
        _user_id: &str,
        _message: &str,
    ) -> Result<bool, PeerRpcError> {
        std::future::pending().await
    }
}

#[test_timeout::tokio_timeout_test]
async fn chained_seeds_converge_to_full_membership() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", Some("10.0.0.2:7002"));
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", Some("10.0.0.3:7003"));
    let c = spawn_node(&network, "10.0.0.3", 7003, "node-c", None);

    run_rounds(&[&a, &b, &c], 4).await;

    assert_eq!(a.confirmed_ids(), vec!["node-b", "node-c"]);
    assert_eq!(b.confirmed_ids(), vec!["node-a", "node-c"]);
    assert_eq!(c.confirmed_ids(), vec!["node-a", "node-b"]);
    for node in [&a, &b, &c] {
        assert!(node.agent.candidates().is_empty(), "{} has leftovers", node.address);
    }

    let c_seen_by_a = a
        .agent
        .confirmed()
        .snapshot()
        .into_iter()
        .find(|peer| peer.machine_id == "node-c")
        .unwrap();
    assert_eq!(c_seen_by_a.remote_address, c.address);
}

#[test_timeout::tokio_timeout_test]
async fn self_seed_is_dropped_not_confirmed() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", Some("10.0.0.1:7001"));

    let report = a.agent.run_cycle().await;
    run_rounds(&[&a], 2).await;

    assert_eq!(report.dropped_self, 1);
    assert_eq!(report.promoted, 0);
    assert!(a.agent.confirmed().is_empty());
    assert!(a.agent.candidates().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn unreachable_candidate_is_kept_for_retry() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", Some("10.0.0.2:7002"));

    let report = a.agent.run_cycle().await;
    assert_eq!(report.failed, 1);
    assert!(a.agent.candidates().contains("", "10.0.0.2:7002"));

    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", None);
    let report = a.agent.run_cycle().await;
    assert_eq!(report.promoted, 1);
    assert_eq!(a.confirmed_ids(), vec!["node-b"]);
    drop(b);
}

#[test_timeout::tokio_timeout_test]
async fn handshake_adopts_identity_reported_by_peer() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);
    let _b = spawn_node(&network, "10.0.0.2", 7002, "node-b", None);
    a.agent
        .record_candidate(PeerDescriptor::new("10.0.0.2:7002", "stale-id"));

    a.agent.handshake_candidates().await;

    assert_eq!(
        a.agent.confirmed().snapshot(),
        vec![PeerDescriptor::new("10.0.0.2:7002", "node-b")]
    );
}

#[test_timeout::tokio_timeout_test]
async fn inbound_handshake_rewrites_claimed_host() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);

    let reply = a
        .agent
        .accept_handshake(
            PeerDescriptor::new("1.2.3.4:9999", "node-x"),
            "5.6.7.8".parse().unwrap(),
        )
        .unwrap();

    assert_eq!(reply, PeerDescriptor::new("0.0.0.0:7001", "node-a"));
    assert_eq!(
        a.agent.candidates().snapshot(),
        vec![PeerDescriptor::new("5.6.7.8:9999", "node-x")]
    );
}

#[test_timeout::tokio_timeout_test]
async fn inbound_query_with_bad_address_is_rejected() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);

    let result = a
        .agent
        .accept_peer_query(PeerDescriptor::new("nowhere", "node-x"), "5.6.7.8".parse().unwrap());

    assert!(matches!(result, Err(AddressError::MissingPort(_))));
    assert!(a.agent.candidates().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn inbound_calls_from_self_are_not_recorded() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);

    a.agent
        .accept_handshake(a.agent.local_descriptor(), "127.0.0.1".parse().unwrap())
        .unwrap();

    assert!(a.agent.candidates().is_empty());
}

#[test_timeout::tokio_timeout_test]
async fn sequential_route_reaches_peer_with_user() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", Some("10.0.0.1:7001"));
    run_rounds(&[&b], 1).await;

    let handle = a.sessions.connect("u1", "192.168.1.10:50000");
    assert!(b.agent.route_sequential("u1", "hello").await);
    assert_eq!(
        handle.wait(Duration::from_millis(50)).await.as_deref(),
        Some("hello")
    );

    assert!(!b.agent.route_sequential("nobody", "hello").await);
}

#[test_timeout::tokio_timeout_test]
async fn parallel_route_targets_every_peer() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);
    let c = spawn_node(&network, "10.0.0.3", 7003, "node-c", None);
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", Some("10.0.0.1:7001"));
    b.agent
        .record_candidate(PeerDescriptor::address_only("10.0.0.3:7003"));
    b.agent.handshake_candidates().await;
    assert_eq!(b.confirmed_ids(), vec!["node-a", "node-c"]);

    // The user sits on the first confirmed peer, then on the last one.
    let first = a.sessions.connect("u-first", "192.168.1.10:50000");
    let last = c.sessions.connect("u-last", "192.168.1.11:50000");

    assert!(b.agent.route_parallel("u-first", "one").await);
    assert!(b.agent.route_parallel("u-last", "two").await);
    assert!(!b.agent.route_parallel("u-missing", "three").await);

    assert_eq!(first.wait(Duration::from_millis(50)).await.as_deref(), Some("one"));
    assert_eq!(last.wait(Duration::from_millis(50)).await.as_deref(), Some("two"));
}

#[test_timeout::tokio_timeout_test]
async fn route_skips_dead_peers() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", None);
    b.agent
        .confirmed()
        .add_if_absent(PeerDescriptor::new("10.0.0.9:7009", "node-gone"));
    b.agent
        .confirmed()
        .add_if_absent(PeerDescriptor::new(a.address.clone(), "node-a"));

    let _handle = a.sessions.connect("u1", "192.168.1.10:50000");

    assert!(b.agent.route_sequential("u1", "first").await);
    assert!(b.agent.route("u1", "second").await);
    assert_eq!(a.sessions.mailbox("u1").unwrap().pending_messages(), 2);
}

#[test_timeout::tokio_timeout_test]
async fn peer_that_goes_down_stops_accepting_but_stays_confirmed() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", None);
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", Some("10.0.0.1:7001"));
    run_rounds(&[&b], 1).await;
    let _handle = a.sessions.connect("u1", "192.168.1.10:50000");
    assert!(b.agent.route("u1", "before").await);

    network.detach(&a.address);

    assert!(!b.agent.route("u1", "after").await);
    assert_eq!(b.agent.exchange_peers().await, 0);
    assert_eq!(b.confirmed_ids(), vec!["node-a"]);
    assert_eq!(a.sessions.mailbox("u1").unwrap().pending_messages(), 1);
}

#[test_timeout::tokio_timeout_test]
async fn route_without_peers_fails() {
    let network = LocalPeerNetwork::new();
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", None);

    assert!(!b.agent.route_sequential("u1", "x").await);
    assert!(!b.agent.route_parallel("u1", "x").await);
}

#[test_timeout::tokio_timeout_test]
async fn stalled_peer_counts_as_failure_after_timeout() {
    let identity = NodeIdentity {
        machine_id: "node-b".into(),
        port: 7002,
        seed: Some("10.0.0.1:7001".into()),
    };
    let agent = ClusterAgent::new(identity, quick_config(), Arc::new(StalledRpc));
    agent
        .confirmed()
        .add_if_absent(PeerDescriptor::new("10.0.0.3:7003", "node-c"));

    let started = Instant::now();
    let report = agent.handshake_candidates().await;
    let delivered = agent.route_parallel("u1", "x").await;
    let discovered = agent.exchange_peers().await;

    assert_eq!(report.failed, 1);
    assert!(!delivered);
    assert_eq!(discovered, 0);
    assert!(agent.candidates().contains("", "10.0.0.1:7001"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test_timeout::tokio_timeout_test]
async fn maintenance_loop_confirms_peers_in_background() {
    let network = LocalPeerNetwork::new();
    let a = spawn_node(&network, "10.0.0.1", 7001, "node-a", Some("10.0.0.2:7002"));
    let b = spawn_node(&network, "10.0.0.2", 7002, "node-b", None);

    let loops = [a.agent.spawn_maintenance(), b.agent.spawn_maintenance()];
    tokio::time::sleep(Duration::from_millis(200)).await;
    for task in loops {
        task.abort();
    }

    assert_eq!(a.confirmed_ids(), vec!["node-b"]);
    assert_eq!(b.confirmed_ids(), vec!["node-a"]);
}

#[test_timeout::timeout]
fn fanout_mode_parses_case_insensitively() {
    assert_eq!("Sequential".parse::<FanoutMode>(), Ok(FanoutMode::Sequential));
    assert_eq!("parallel".parse::<FanoutMode>(), Ok(FanoutMode::Parallel));
    assert!("broadcast".parse::<FanoutMode>().is_err());
}
