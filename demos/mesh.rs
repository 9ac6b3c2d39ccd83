//! Runs a single mesh node and prints membership events as they arrive.
//!
//! Start a founder, then point further nodes at it:
//!
//! ```text
//! mesh
//! mesh --join 127.0.0.1:49152
//! mesh --join 127.0.0.1:49152 --memo "hello from the third node"
//! ```

use gossip_mesh::Node;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut peers: Vec<SocketAddr> = vec![];
    let mut memo: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--join" => {
                peers.push(args[i + 1].parse()?);
                i += 2;
            }
            "--memo" => {
                memo = Some(args[i + 1].clone());
                i += 2;
            }
            _ => {
                eprintln!("Usage: {} [--join <addr:port>] [--memo <text>]", args[0]);
                std::process::exit(1);
            }
        }
    }

    let node = Node::start().await?;
    println!("node {} listening on {}", node.id(), node.local_addr());

    node.on_join(|id, addr| println!("joined: {id} at {addr}"));
    node.on_memo(|id, _addr, body| {
        println!("memo from {id}: {}", String::from_utf8_lossy(&body));
    });
    node.on_fail(|id| println!("failed: {id}"));

    for peer in peers {
        node.join(peer).await?;
    }
    if let Some(text) = memo {
        node.post_memo(text.into_bytes()).await?;
    }

    std::future::pending::<()>().await;
    unreachable!()
}
