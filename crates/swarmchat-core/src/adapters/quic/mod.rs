//! QUIC rendezvous: the swarm endpoint peers run and the tracker they meet at.

pub mod swarm;
pub mod tls;
pub mod tracker;
