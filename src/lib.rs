//! SWIM Group Membership Library
//!
//! This library crate implements a decentralized, weakly-consistent group
//! membership service with gossip dissemination, after the SWIM protocol.
//! Each node keeps an eventually consistent view of the set of live peers,
//! detects failures by randomized probing, and piggybacks membership news
//! and application memos on probe traffic until they have spread through
//! the network with high probability.
//!
//! ## Architecture Modules
//! The crate is composed of four loosely coupled subsystems:
//!
//! - **`protocol`**: The pure SWIM state machine. Drives ping/ping-request/
//!   ack exchanges over protocol periods, maintains the member table under
//!   the incarnation/suspicion discipline, and meters dissemination through
//!   recurrent queues. No I/O, no timers, injected randomness.
//! - **`order`**: The round-robin-random probe ordering, guaranteeing every
//!   member is probed once per round with rounds freshly shuffled.
//! - **`queue`**: The recurrent priority queue that re-posts each piece of
//!   gossip a logarithmic-in-network-size number of times before retiring
//!   it.
//! - **`node`**: The driver. Binds the UDP socket, runs the period and ping
//!   timers, serializes packets, and delivers join/memo/fail events to the
//!   host application.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use gossip_mesh::Node;
//!
//! let node = Node::start().await?;
//! node.on_join(|id, addr| println!("joined: {id} at {addr}"));
//! node.on_memo(|id, _addr, body| {
//!     println!("memo from {id}: {}", String::from_utf8_lossy(&body));
//! });
//! node.on_fail(|id| println!("failed: {id}"));
//!
//! node.join("192.0.2.1:7946".parse()?).await?;
//! node.post_memo(&b"Hello, SWIM!"[..]).await?;
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod order;
pub mod protocol;
pub mod queue;

pub use node::service::{Config, Node};
pub use protocol::types::{Event, NodeId};
