//! Tracker wire messages.
//!
//! These travel over a reliable QUIC bidirectional stream between a peer and
//! the tracker, encoded as CBOR. Pure data — no I/O.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use super::topic::Topic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerMsg {
    /// Peer → tracker: accept inbound connections for `topic` at the address
    /// the tracker observes for this connection.
    Announce { topic: Topic },
    /// Peer → tracker: stop advertising `topic`.
    Unannounce { topic: Topic },
    /// Peer → tracker: who announced `topic`? Answered with [`TrackerMsg::Peers`].
    Lookup { topic: Topic },
    /// Tracker → peer: addresses announced for `topic`, requester excluded.
    Peers { topic: Topic, peers: Vec<SocketAddr> },
}
