//! Use cases and the ports they drive.

pub mod drive_bootstrap;
pub mod handshake;
pub mod local_command;
pub mod ports;
pub mod registry;
pub mod room_session;
pub mod router;
