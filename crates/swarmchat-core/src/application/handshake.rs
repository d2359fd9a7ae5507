//! Handshake use case — name and drive-key negotiation over the chat stream.
//!
//! On open every connection is sent `/name?`, plus `/drive_key?` while we
//! have no drive. Replies arrive as ordinary lines and are fed back here by
//! the message router.

use tracing::{debug, info};

use crate::domain::control::ControlMsg;
use crate::domain::identity::{ConnId, DriveKey};

use super::drive_bootstrap::{Decision, DriveBootstrap, DriveSource};
use super::ports::ChatEvent;
use super::registry::{ConnectionRegistry, NameChange};

/// What the session has to do after a handshake step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub events: Vec<ChatEvent>,
    /// Start following this drive (the bootstrap already moved to in-progress).
    pub start_drive: Option<DriveKey>,
}

impl Outcome {
    fn event(mut self, event: ChatEvent) -> Self {
        self.events.push(event);
        self
    }
}

/// Per-connection negotiation.
///
/// A connection is awaiting its name until the registry holds one for it, and
/// awaiting a drive key until the [`DriveBootstrap`] leaves `Idle`; neither
/// needs separate bookkeeping here.
pub struct Handshake {
    local_name: String,
    relay_followed_key: bool,
}

impl Handshake {
    pub fn new(local_name: impl Into<String>, relay_followed_key: bool) -> Self {
        Self {
            local_name: local_name.into(),
            relay_followed_key,
        }
    }

    /// Send the opening queries on a freshly opened connection.
    pub fn on_open(&self, id: ConnId, registry: &ConnectionRegistry, boot: &DriveBootstrap) {
        registry.send(id, ControlMsg::NameQuery.to_string());
        if !boot.is_open() {
            debug!(%id, "Drive key not set, requesting from peer");
            registry.send(id, ControlMsg::DriveKeyQuery.to_string());
        }
    }

    /// Handle one inbound control message from connection `id`.
    pub fn on_control(
        &self,
        id: ConnId,
        msg: ControlMsg,
        registry: &mut ConnectionRegistry,
        boot: &mut DriveBootstrap,
    ) -> Outcome {
        match msg {
            ControlMsg::NameQuery => {
                registry.send(id, ControlMsg::Name(self.local_name.clone()).to_string());
                Outcome::default()
            }

            ControlMsg::Name(name) => {
                let fingerprint = registry.fingerprint(id).unwrap_or_else(|| id.to_string());
                match registry.set_name(id, &name) {
                    NameChange::Named => {
                        info!(%id, %name, "Peer named");
                        Outcome::default().event(ChatEvent::Info(format!(
                            "Peer {fingerprint} is now known as {name}"
                        )))
                    }
                    NameChange::Renamed { previous } => Outcome::default().event(
                        ChatEvent::Info(format!(
                            "Peer {fingerprint} renamed from {previous} to {name}"
                        )),
                    ),
                    NameChange::Unchanged | NameChange::UnknownConnection => Outcome::default(),
                }
            }

            ControlMsg::DriveKeyQuery => {
                match boot.answerable_key(self.relay_followed_key) {
                    Some(key) => {
                        registry.send(id, ControlMsg::DriveKey(key).to_string());
                    }
                    None => debug!(%id, "No drive key to share, staying silent"),
                }
                Outcome::default()
            }

            ControlMsg::DriveKey(key) => self.on_drive_key(id, key, registry, boot),
        }
    }

    fn on_drive_key(
        &self,
        id: ConnId,
        key: DriveKey,
        registry: &ConnectionRegistry,
        boot: &mut DriveBootstrap,
    ) -> Outcome {
        if boot.is_open() || boot.in_progress() {
            info!(%id, %key, "Ignoring drive key, drive already set");
            return Outcome::default().event(ChatEvent::Info("Drive already set".into()));
        }

        let outcome =
            Outcome::default().event(ChatEvent::Info(format!("Received drive key: {key}")));

        match boot.begin(Some(key), DriveSource::Peer(registry.label(id))) {
            Decision::Start(key) => Outcome {
                start_drive: key,
                ..outcome
            },
            Decision::Abandoned => outcome.event(ChatEvent::Debug(
                "Drive initialisation failed earlier, ignoring key".into(),
            )),
            Decision::AlreadyOpen | Decision::InProgress => outcome,
        }
    }
}
