use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::protocol::types::{NodeId, Packet};

/// The datagram envelope: every packet travels with its sender's id. The
/// sender's address is not transmitted; the receiver takes it from the UDP
/// source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Envelope {
    from: NodeId,
    packet: Packet,
}

pub fn encode(from: &NodeId, packet: &Packet) -> Result<Vec<u8>> {
    let envelope = Envelope {
        from: from.clone(),
        packet: packet.clone(),
    };
    Ok(bincode::serialize(&envelope)?)
}

pub fn decode(bytes: &[u8]) -> Result<(NodeId, Packet)> {
    let envelope: Envelope = bincode::deserialize(bytes)?;
    Ok((envelope.from, envelope.packet))
}
