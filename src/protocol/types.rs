use data_encoding::BASE32;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// Unique identifier for a node in the network.
/// Minted from 15 cryptographically random bytes and rendered as a 24-char
/// base32 string; compared by value, never ordered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn mint() -> Self {
        Self(random_token())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a memo, minted like a node id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MemoId(pub String);

impl MemoId {
    pub fn mint() -> Self {
        Self(random_token())
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 15];
    OsRng.fill_bytes(&mut bytes);
    BASE32.encode(&bytes)
}

/// A node's membership status from the perspective of the local failure
/// detector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Status {
    /// The node is healthy and responsive.
    Alive,
    /// The node has missed a probe window; it can refute the suspicion by
    /// advancing its incarnation, or be declared failed when the suspicion
    /// times out.
    Suspected,
    /// The node is confirmed failed and permanently dismissed.
    Failed,
}

/// User-defined data disseminated alongside membership traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Memo {
    pub id: MemoId,
    pub body: Vec<u8>,
}

/// A single piece of gossip: a claim about one node's membership status,
/// optionally carrying a memo.
///
/// An empty address means the subject's address is unknown to the sender;
/// the receiver fills it in from the packet's UDP source. This is how new
/// peers introduce themselves without knowing their externally visible
/// address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub status: Status,
    pub node: NodeId,
    pub incarnation: u64,
    pub addr: Option<SocketAddr>,
    pub memo: Option<Memo>,
}

impl Message {
    /// Returns a copy of the message without any memo payload, for the
    /// membership queue.
    pub fn stripped(&self) -> Message {
        Message {
            memo: None,
            ..self.clone()
        }
    }
}

/// The wire meaning of a packet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PacketKind {
    /// A direct health probe; the receiver answers with an ack.
    Ping,
    /// "Please ping `target` on my behalf and forward its ack."
    PingReq,
    /// Probe response. When forwarded on behalf of a requestor, `target`
    /// echoes whose ack this is.
    Ack,
}

/// A network packet: a packet kind plus piggybacked gossip messages.
/// `target`/`target_addr` are set for ping requests and forwarded acks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub target: Option<NodeId>,
    pub target_addr: Option<SocketAddr>,
    pub msgs: Vec<Message>,
}

/// An outgoing packet with its resolved destination address.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub addr: SocketAddr,
    pub packet: Packet,
}

/// A membership change or memo observed by the engine, delivered to the
/// host application through the node's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A node joined the network.
    Joined { id: NodeId, addr: SocketAddr },
    /// A node sent a memo.
    Memo {
        id: NodeId,
        addr: SocketAddr,
        body: Vec<u8>,
    },
    /// A node left the network.
    Failed { id: NodeId },
}
