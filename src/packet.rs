//! src/packet.rs
//!
//! The record types exchanged between cluster members. The transport layer
//! frames, signs and delivers these; the engine only ever matches on the
//! variants.

use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Number of random bytes identifying one process lifetime of a member.
pub const VALIDITY_LEN: usize = 8;

pub type Validity = [u8; VALIDITY_LEN];

/// Identifies the member that created a packet. The validity bytes change
/// when a member restarts, letting receivers detect that their assumptions
/// about what the peer has seen are stale.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    pub validity: Validity,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, hex::encode(&self.validity[..4]))
    }
}

/// A packet sent between cluster members.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Asks the destination member to respond with an [`Packet::Ack`].
    Ping { source: Source },

    /// Asks the destination member to ping `target` on behalf of `source`,
    /// forwarding any ack it receives.
    PingReq { source: Source, target: String },

    /// Indicates that `source` is online.
    Ack { source: Source },

    /// Asserts that member `name` had `status` and `metadata` at sequence
    /// clock `clock`. `metadata` is `None` when the sender has not yet
    /// learned the member's metadata.
    Gossip {
        source: Source,
        name: String,
        clock: u64,
        status: Status,
        metadata: Option<HashMap<String, Vec<u8>>>,
    },

    /// Confirms receipt of member `name`'s state up to `clock`, so the
    /// sender stops re-gossiping it.
    GossipAck {
        source: Source,
        name: String,
        clock: u64,
    },
}

impl Packet {
    /// The member that created this packet.
    pub fn source(&self) -> &Source {
        match self {
            Packet::Ping { source }
            | Packet::PingReq { source, .. }
            | Packet::Ack { source }
            | Packet::Gossip { source, .. }
            | Packet::GossipAck { source, .. } => source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> Source {
        Source {
            name: name.to_string(),
            validity: [7; VALIDITY_LEN],
        }
    }

    #[test]
    fn test_gossip_roundtrip() {
        let packet = Packet::Gossip {
            source: source("10.0.0.1:7374"),
            name: "10.0.0.2:7374".to_string(),
            clock: 42,
            status: Status::SUSPECT,
            metadata: Some(HashMap::from([("token".to_string(), vec![0xAA])])),
        };
        let bytes = bincode::serialize(&packet).unwrap();
        let decoded: Packet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_unknown_metadata_roundtrip() {
        let packet = Packet::Gossip {
            source: source("a:1"),
            name: "b:2".to_string(),
            clock: 1,
            status: Status::OFFLINE,
            metadata: None,
        };
        let bytes = bincode::serialize(&packet).unwrap();
        let decoded: Packet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(packet, decoded);
    }

    #[test]
    fn test_source_accessor() {
        let ping = Packet::Ping { source: source("a:1") };
        assert_eq!("a:1", ping.source().name);
        let ack = Packet::Ack { source: source("b:2") };
        assert_eq!("b:2", ack.source().name);
    }
}
