//! Port traits (interfaces) that use cases depend on.
//!
//! Adapters implement these traits; use cases never reference Quinn, the
//! tracker, or a particular drive backend.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::domain::identity::{DriveKey, PeerKey};
use crate::domain::topic::Topic;

// ---------------------------------------------------------------------------
// Rendezvous (discovery + transport substrate)
// ---------------------------------------------------------------------------

/// Roles taken when joining a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Look up peers that announced the topic and dial them.
    pub client: bool,
    /// Announce the topic and accept inbound connections for it.
    pub server: bool,
}

impl JoinOptions {
    pub const BOTH: Self = Self {
        client: true,
        server: true,
    };
}

/// One established, encrypted, ordered duplex stream to a remote participant.
pub struct PeerStream {
    pub remote_key: PeerKey,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerStream")
            .field("remote_key", &self.remote_key.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Result of joining a topic: a stream of connections plus the signal that
/// the initial discovery pass is over.
pub struct Discovery {
    pub connections: mpsc::UnboundedReceiver<PeerStream>,
    pub flushed: oneshot::Receiver<()>,
}

/// Turns a topic into live connections to other participants of that topic.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Our own node key, as seen by remote peers.
    fn local_key(&self) -> PeerKey;

    /// Join `topic`. Connections keep arriving on the returned [`Discovery`]
    /// until the topic is left or the rendezvous destroyed.
    async fn join(&self, topic: Topic, options: JoinOptions) -> anyhow::Result<Discovery>;

    /// Stop announcing `topic` and stop routing new connections for it.
    async fn leave(&self, topic: Topic) -> anyhow::Result<()>;

    /// Leave every topic and close all connections.
    async fn destroy(&self);
}

// ---------------------------------------------------------------------------
// Drive (replicated key-value store)
// ---------------------------------------------------------------------------

/// A shared key-value store addressed by its [`DriveKey`].
#[async_trait]
pub trait Drive: Send + Sync {
    fn key(&self) -> DriveKey;

    /// Whether this side holds the drive's signing key.
    fn writable(&self) -> bool;

    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>>;

    /// Keep this drive in sync with the remote side of `stream` until it closes.
    async fn replicate(&self, stream: PeerStream) -> anyhow::Result<()>;

    async fn close(&self);
}

/// Opens drives, either as their creator or as a follower of a known key.
#[async_trait]
pub trait DriveFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn Drive>>;

    async fn open(&self, key: DriveKey) -> anyhow::Result<Arc<dyn Drive>>;
}

// ---------------------------------------------------------------------------
// App events (UI bridge)
// ---------------------------------------------------------------------------

/// What the user gets to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A chat line from a peer, labelled with its best-known name.
    Message { from: String, text: String },
    Info(String),
    Debug(String),
    Error(String),
}

impl ChatEvent {
    /// Label shown in front of the line, e.g. `info` in `[info] Peer a1b2c3 joined`.
    pub fn label(&self) -> &str {
        match self {
            Self::Message { from, .. } => from,
            Self::Info(_) => "info",
            Self::Debug(_) => "debug",
            Self::Error(_) => "error",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Message { text, .. } => text,
            Self::Info(text) | Self::Debug(text) | Self::Error(text) => text,
        }
    }
}

/// Emits events toward the UI layer (a terminal, or a recorder in tests).
#[async_trait]
pub trait AppEvents: Send + Sync {
    async fn emit(&self, event: ChatEvent);
}
