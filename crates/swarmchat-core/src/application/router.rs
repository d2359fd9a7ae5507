//! Message router — splits inbound lines into control messages and chat.

use crate::domain::control::ControlMsg;
use crate::domain::identity::ConnId;

use super::drive_bootstrap::DriveBootstrap;
use super::handshake::{Handshake, Outcome};
use super::ports::ChatEvent;
use super::registry::ConnectionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(ControlMsg),
    Chat(String),
}

/// Decode one received record. Invalid UTF-8 becomes U+FFFD, and a trailing
/// `\n` or `\r\n` is dropped if present.
pub fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

pub fn classify(line: String) -> Inbound {
    match ControlMsg::parse(&line) {
        Some(msg) => Inbound::Control(msg),
        None => Inbound::Chat(line),
    }
}

/// Route one decoded line received on connection `id`.
pub fn dispatch(
    id: ConnId,
    line: String,
    handshake: &Handshake,
    registry: &mut ConnectionRegistry,
    boot: &mut DriveBootstrap,
) -> Outcome {
    match classify(line) {
        Inbound::Control(msg) => handshake.on_control(id, msg, registry, boot),
        Inbound::Chat(text) => Outcome {
            events: vec![ChatEvent::Message {
                from: registry.label(id),
                text,
            }],
            start_drive: None,
        },
    }
}
