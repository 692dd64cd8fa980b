use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use freedomnames::{
    errors::{Error, StoreError},
    network::{NetworkHost, PeerStore},
    testnet::Testnet,
    Bytes, CancelToken, NameDirectory, Node, NodeStatus,
};
use tempfile::TempDir;

struct Network {
    testnet: Testnet,
    _dir: TempDir,
    bootstrap: Node,
    nodes: Vec<Node>,
}

impl Network {
    /// A bootstrap node and `size` nodes joining through it.
    fn new(size: usize) -> Self {
        let testnet = Testnet::new();
        let dir = TempDir::new().unwrap();

        let bootstrap = Node::builder()
            .bootstrap_node()
            .key_path(dir.path().join("bootstrap.key"))
            .build(Arc::new(testnet.clone()));
        bootstrap.start().unwrap();

        let bootstrap_addrs = testnet.p2p_addrs(&bootstrap.peer_id().unwrap());

        let nodes = (0..size)
            .map(|i| {
                let node = Node::builder()
                    .key_path(dir.path().join(format!("node-{i}.key")))
                    .bootstrap(&bootstrap_addrs)
                    .stats_interval(Duration::from_millis(10))
                    .build(Arc::new(testnet.clone()));
                node.start().unwrap();
                node
            })
            .collect();

        Self {
            testnet,
            _dir: dir,
            bootstrap,
            nodes,
        }
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
        self.bootstrap.shutdown();
    }
}

fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }

    condition()
}

#[test]
fn resolve_names_published_elsewhere() -> Result<(), Error> {
    let network = Network::new(3);
    let cancel = CancelToken::new();

    let alice = NameDirectory::new(network.nodes[0].clone());
    let bob = NameDirectory::new(network.nodes[2].clone());

    alice.publish("alice.fn", "10.0.0.5", &cancel)?;

    assert_eq!(
        bob.resolve("alice.fn", &cancel)?,
        Some(Bytes::from_static(b"10.0.0.5"))
    );
    assert_eq!(bob.resolve("unknown.fn", &cancel)?, None);

    let bootstrap_store = network
        .testnet
        .store(&network.bootstrap.peer_id().unwrap())
        .unwrap();
    assert_eq!(
        bootstrap_store.local_record(b"/fn/alice.fn"),
        Some(Bytes::from_static(b"10.0.0.5"))
    );

    network.shutdown();

    Ok(())
}

#[test]
fn concurrent_resolves_across_nodes() {
    let network = Network::new(4);
    let cancel = CancelToken::new();

    NameDirectory::new(network.nodes[0].clone())
        .publish("shared.fn", "10.0.0.9", &cancel)
        .unwrap();

    let directories: Vec<_> = network
        .nodes
        .iter()
        .map(|node| NameDirectory::new(node.clone()))
        .collect();

    thread::scope(|scope| {
        for directory in &directories {
            for _ in 0..4 {
                scope.spawn(|| {
                    assert_eq!(
                        directory.resolve("shared.fn", &cancel).unwrap(),
                        Some(Bytes::from_static(b"10.0.0.9"))
                    );
                });
            }
        }
    });

    network.shutdown();
}

#[test]
fn disconnected_peers_are_forgotten() {
    let network = Network::new(2);

    let a = network.nodes[0].peer_id().unwrap();
    let b = network.nodes[1].peer_id().unwrap();

    // Both nodes found each other through local discovery.
    let host_a = network.testnet.host(&a).unwrap();
    let host_b = network.testnet.host(&b).unwrap();
    assert!(wait_until(|| host_a.is_connected(&b)));
    assert!(host_a.peer_store().protocols(&b).is_ok());

    host_a.disconnect(&b);

    assert!(wait_until(|| {
        host_a.peer_store().protocols(&b).is_err() && host_b.peer_store().protocols(&a).is_err()
    }));
    assert!(host_a.peer_store().addrs(&b).is_empty());

    network.shutdown();
}

#[test]
fn shutdown_cancels_in_flight_store_calls() {
    let network = Network::new(1);
    let node = network.nodes[0].clone();
    let directory = NameDirectory::new(node.clone());

    network
        .testnet
        .store(&node.peer_id().unwrap())
        .unwrap()
        .set_latency(Duration::from_secs(60));

    let started = Instant::now();

    let result = thread::scope(|scope| {
        let resolve = scope.spawn(|| directory.resolve("slow.fn", node.cancel_token()));

        thread::sleep(Duration::from_millis(50));
        node.shutdown();

        resolve.join().unwrap()
    });

    assert_eq!(result, Err(StoreError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(node.status(), NodeStatus::Stopped);
    assert_eq!(
        directory.resolve("slow.fn", &CancelToken::new()),
        Err(StoreError::NotInitialized)
    );

    network.shutdown();
}

#[test]
fn request_timeout_bounds_store_calls() {
    let testnet = Testnet::new();
    let dir = TempDir::new().unwrap();

    let node = Node::builder()
        .bootstrap_node()
        .key_path(dir.path().join("a.key"))
        .request_timeout(Duration::from_millis(20))
        .build(Arc::new(testnet.clone()));
    node.start().unwrap();

    testnet
        .store(&node.peer_id().unwrap())
        .unwrap()
        .set_latency(Duration::from_secs(60));

    let directory = NameDirectory::new(node.clone());

    assert_eq!(
        directory.resolve("slow.fn", &CancelToken::new()),
        Err(StoreError::TimedOut)
    );

    node.shutdown();
}

#[test]
fn stats_reflect_connections() {
    let network = Network::new(2);

    let stats = network.nodes[0].stats();

    assert!(stats.connected_peers >= 1);
    assert!(stats.bandwidth.total_in > 0);

    network.shutdown();

    assert_eq!(network.nodes[0].stats().connected_peers, 0);
}
