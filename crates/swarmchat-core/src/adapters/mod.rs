//! Implementations of the application ports.

pub mod codec;
pub mod crypto;
pub mod drive;
pub mod memory_swarm;
pub mod quic;
