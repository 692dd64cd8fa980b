//! Publish a name on one node of an in-process network and resolve it from
//! another.
//!
//! Run: `cargo run --example testnet -- alice.fn 10.0.0.5 --nodes 8`

use std::{sync::Arc, time::Instant};

use clap::Parser;
use freedomnames::{testnet::Testnet, CancelToken, NameDirectory, Node};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Name to publish
    name: String,
    /// Value to map the name to
    value: String,
    /// Number of nodes joining through the bootstrap node
    #[arg(long, default_value_t = 8)]
    nodes: usize,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let testnet = Testnet::new();
    let dir = tempfile::tempdir().unwrap();

    let bootstrap = Node::builder()
        .bootstrap_node()
        .key_path(dir.path().join("bootstrap.key"))
        .build(Arc::new(testnet.clone()));
    bootstrap.start().unwrap();

    let bootstrap_addrs = testnet.p2p_addrs(&bootstrap.peer_id().unwrap());

    let nodes: Vec<Node> = (0..cli.nodes.max(2))
        .map(|i| {
            let node = Node::builder()
                .key_path(dir.path().join(format!("node-{i}.key")))
                .bootstrap(&bootstrap_addrs)
                .build(Arc::new(testnet.clone()));
            node.start().unwrap();
            node
        })
        .collect();

    let cancel = CancelToken::new();
    let publisher = NameDirectory::new(nodes[0].clone());
    let resolver = NameDirectory::new(nodes[nodes.len() - 1].clone());

    let start = Instant::now();
    match publisher.publish(cli.name.as_str(), cli.value.clone(), &cancel) {
        Ok(()) => println!("\nPublished {} in {:?}", cli.name, start.elapsed()),
        Err(error) => println!("\nError: {error}"),
    }

    let start = Instant::now();
    match resolver.resolve(&cli.name, &cancel) {
        Ok(Some(value)) => println!(
            "Resolved {} => {} in {:?}",
            cli.name,
            String::from_utf8_lossy(&value),
            start.elapsed()
        ),
        Ok(None) => println!("{} not found", cli.name),
        Err(error) => println!("Error: {error}"),
    }

    println!("\n{:?}\n", resolver.node().stats());

    for node in &nodes {
        node.shutdown();
    }
    bootstrap.shutdown();
}
