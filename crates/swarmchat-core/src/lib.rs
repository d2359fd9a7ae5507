//! swarmchat-core — control plane for a minimal peer-to-peer chat room with a
//! shared, replicated key-value drive.
//!
//! # Architecture
//!
//! - **domain**: topic derivation, identifiers, control-message grammar and
//!   tracker wire messages (no I/O).
//! - **application**: the room session and its parts (connection registry,
//!   handshake, message router, drive bootstrap) plus the port traits.
//! - **adapters**: QUIC rendezvous and tracker (Quinn), in-memory rendezvous,
//!   in-memory signed drive, CBOR framing.

pub mod adapters;
pub mod application;
pub mod domain;

pub use application::ports::{AppEvents, ChatEvent, Drive, DriveFactory, Rendezvous};
pub use application::room_session::{RoomSession, SessionConfig, DEFAULT_FALLBACK_DELAY};
pub use domain::topic::Topic;
