//! Runs a small network of nodes on localhost, stores content from one node
//! and reads it back from another.
//!
//! Run: `cargo run --example local_network -- --nodes 8 --topic hello`

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use authdht::{BatchItem, Bytes, Config, ContentFilter, Id, Issuer, Node};

use clap::Parser;
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of nodes in the network
    #[arg(short, long, default_value_t = 8)]
    nodes: usize,
    /// Topic hashed into the storage key
    #[arg(short, long, default_value = "topic")]
    topic: String,
    /// Value stored under the topic
    #[arg(short, long, default_value = "hello")]
    value: String,
    /// Per call timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout: u64,
    /// Log at debug level
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let config = Config {
        request_timeout: Duration::from_millis(cli.timeout),
        ..Default::default()
    };
    let localhost = SocketAddr::from(([127, 0, 0, 1], 0));
    let issuer = Issuer::random();

    let seed = Node::builder()
        .config(config.clone())
        .issued_by(&issuer, "seed")
        .bind(localhost)
        .build()
        .expect("failed to start the seed node");
    let list = issuer.sign_bootstrap(vec![(seed.id(), seed.local_addr())]);

    let mut nodes = vec![seed];

    let start = Instant::now();
    for i in 1..cli.nodes.max(2) {
        let node = Node::builder()
            .config(config.clone())
            .issued_by(&issuer, &format!("user-{i}"))
            .bind(localhost)
            .bootstrap(list.clone())
            .build()
            .expect("failed to start node");

        if !node.bootstrap().wait().unwrap_or(false) {
            println!("node {} failed to bootstrap", node.id());
        }
        nodes.push(node);
    }
    println!(
        "\nStarted {} nodes in {:?} seconds",
        nodes.len(),
        start.elapsed().as_secs_f32()
    );

    for node in &nodes {
        let info = node.info();
        println!(
            "  {} at {} knows {} contacts",
            info.id(),
            info.local_addr(),
            info.routing_table_size()
        );
    }

    let key = Id::digest(&cli.topic);
    let writer = &nodes[1];
    let reader = &nodes[nodes.len() - 1];

    let start = Instant::now();
    let stored = writer
        .put(
            key,
            vec![BatchItem {
                content_type: "text".to_string(),
                value: Bytes::from(cli.value.clone()),
                ttl: Duration::from_secs(60 * 60),
            }],
        )
        .expect("content too large")
        .wait();
    println!(
        "\nPut {:?} under {} in {:?} seconds: {:?} stores acknowledged",
        cli.value,
        key,
        start.elapsed().as_secs_f32(),
        stored
    );

    let start = Instant::now();
    match reader.get(key, ContentFilter::default(), 1).wait() {
        Ok(entries) => {
            for entry in entries {
                println!(
                    "Got {:?} from {} in {:?} seconds",
                    String::from_utf8_lossy(&entry.value),
                    entry.owner,
                    start.elapsed().as_secs_f32()
                );
            }
        }
        Err(error) => println!("Get failed: {error}"),
    }

    for node in &nodes {
        node.shutdown();
    }
}
