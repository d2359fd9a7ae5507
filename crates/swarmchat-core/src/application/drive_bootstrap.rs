//! DriveBootstrap use case — at most one shared drive per session.
//!
//! Two kinds of trigger race to bring the drive up: a `/drive_key=` assertion
//! from any connection, and the fallback timer armed when the room is joined.
//! [`DriveBootstrap::begin`] is the single check-and-set; it runs on the
//! session's event loop, so there is nothing between the check and the set
//! that another trigger could interleave with.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::identity::DriveKey;
use crate::domain::topic::Topic;

use super::ports::{Drive, DriveFactory, JoinOptions, Rendezvous};

/// Where the drive key came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveSource {
    /// Generated locally after the fallback window.
    Created,
    /// Asserted by the peer with this label.
    Peer(String),
}

enum State {
    Idle,
    Initializing(DriveSource),
    Open {
        drive: Arc<dyn Drive>,
        source: DriveSource,
    },
    Failed,
}

/// Answer to a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The caller must now run initialisation (create when `None`).
    Start(Option<DriveKey>),
    AlreadyOpen,
    InProgress,
    /// A previous attempt failed; initialisation is never retried.
    Abandoned,
}

pub struct DriveBootstrap {
    state: State,
}

impl Default for DriveBootstrap {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveBootstrap {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open { .. })
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.state, State::Initializing(_))
    }

    pub fn drive(&self) -> Option<&Arc<dyn Drive>> {
        match &self.state {
            State::Open { drive, .. } => Some(drive),
            _ => None,
        }
    }

    /// Key to hand out in reply to `/drive_key?`.
    ///
    /// A drive we created is always answerable. A followed drive is only
    /// re-advertised when `relay_followed` is set.
    pub fn answerable_key(&self, relay_followed: bool) -> Option<DriveKey> {
        match &self.state {
            State::Open {
                drive,
                source: DriveSource::Created,
            } => Some(drive.key()),
            State::Open { drive, .. } if relay_followed => Some(drive.key()),
            _ => None,
        }
    }

    /// Single-flight entry point. `key` is `None` for the fallback path.
    pub fn begin(&mut self, key: Option<DriveKey>, source: DriveSource) -> Decision {
        match self.state {
            State::Idle => {
                info!(?source, following = ?key, "Drive init started");
                self.state = State::Initializing(source);
                Decision::Start(key)
            }
            State::Initializing(_) => {
                debug!(?source, "Drive init already in progress");
                Decision::InProgress
            }
            State::Open { .. } => {
                debug!(?source, "Drive already set");
                Decision::AlreadyOpen
            }
            State::Failed => {
                debug!(?source, "Drive init failed earlier, not retrying");
                Decision::Abandoned
            }
        }
    }

    /// Record the outcome of the initialisation started by [`begin`](Self::begin).
    pub fn complete(&mut self, result: anyhow::Result<Arc<dyn Drive>>) -> anyhow::Result<()> {
        let source = match std::mem::replace(&mut self.state, State::Failed) {
            State::Initializing(source) => source,
            other => {
                // Completion without a matching begin; keep what we had.
                self.state = other;
                anyhow::bail!("drive init completed while not in progress");
            }
        };
        match result {
            Ok(drive) => {
                info!(key = %drive.key(), ?source, "Drive ready");
                self.state = State::Open { drive, source };
                Ok(())
            }
            Err(e) => {
                warn!(?source, "Drive init failed: {e:#}");
                Err(e)
            }
        }
    }

    pub fn source(&self) -> Option<&DriveSource> {
        match &self.state {
            State::Initializing(source) | State::Open { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Release the drive at session teardown.
    pub async fn close(&mut self) {
        if let State::Open { drive, .. } = &self.state {
            drive.close().await;
        }
    }
}

/// Open (or create) the drive and start replicating it on the drive topic.
///
/// The creator only accepts connections on `drive_topic`; a follower only
/// dials. Resolves once the rendezvous finished its initial discovery pass;
/// replication keeps running until `shutdown` fires.
pub async fn initialize_drive(
    rendezvous: Arc<dyn Rendezvous>,
    drives: Arc<dyn DriveFactory>,
    drive_topic: Topic,
    key: Option<DriveKey>,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn Drive>> {
    info!(
        "{} drive...",
        if key.is_some() { "Joining" } else { "Creating" }
    );
    let drive = match key {
        Some(key) => drives.open(key).await?,
        None => drives.create().await?,
    };
    debug!(key = %drive.key(), "Store ready");

    let options = JoinOptions {
        server: key.is_none(),
        client: key.is_some(),
    };
    let discovery = rendezvous.join(drive_topic, options).await?;
    let mut connections = discovery.connections;

    let replicating = Arc::clone(&drive);
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = connections.recv() => match next {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let drive = Arc::clone(&replicating);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let peer = stream.remote_key.fingerprint();
                debug!(%peer, "Replicating drive");
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    result = drive.replicate(stream) => {
                        if let Err(e) = result {
                            warn!(%peer, "Drive replication ended: {e:#}");
                        }
                    }
                }
            });
        }
    });

    // A dropped sender means the rendezvous went away; nothing left to wait for.
    let _ = discovery.flushed.await;
    debug!("Drive swarm ready");

    Ok(drive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::application::ports::PeerStream;

    struct FakeDrive(DriveKey);

    #[async_trait]
    impl Drive for FakeDrive {
        fn key(&self) -> DriveKey {
            self.0
        }
        fn writable(&self) -> bool {
            false
        }
        async fn put(&self, _key: &str, _value: Bytes) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Bytes>> {
            Ok(None)
        }
        async fn replicate(&self, _stream: PeerStream) -> anyhow::Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn fake(byte: u8) -> Arc<dyn Drive> {
        Arc::new(FakeDrive(DriveKey([byte; 32])))
    }

    #[test]
    fn first_trigger_wins_and_later_ones_are_rejected() {
        let mut boot = DriveBootstrap::new();
        let a = DriveKey([1; 32]);
        let b = DriveKey([2; 32]);

        assert_eq!(
            boot.begin(Some(a), DriveSource::Peer("alice".into())),
            Decision::Start(Some(a))
        );
        assert_eq!(
            boot.begin(Some(b), DriveSource::Peer("bob".into())),
            Decision::InProgress
        );
        assert_eq!(boot.begin(None, DriveSource::Created), Decision::InProgress);

        boot.complete(Ok(fake(1))).unwrap();
        assert!(boot.is_open());
        assert_eq!(boot.begin(None, DriveSource::Created), Decision::AlreadyOpen);
        assert_eq!(
            boot.begin(Some(b), DriveSource::Peer("bob".into())),
            Decision::AlreadyOpen
        );
        assert_eq!(boot.drive().map(|d| d.key()), Some(a));
    }

    #[test]
    fn failure_is_reported_and_never_retried() {
        let mut boot = DriveBootstrap::new();
        assert_eq!(boot.begin(None, DriveSource::Created), Decision::Start(None));
        assert!(boot.complete(Err(anyhow::anyhow!("disk on fire"))).is_err());
        assert!(!boot.is_open());
        assert!(!boot.in_progress());
        assert_eq!(
            boot.begin(Some(DriveKey([3; 32])), DriveSource::Peer("carol".into())),
            Decision::Abandoned
        );
    }

    #[test]
    fn completion_without_begin_is_refused() {
        let mut boot = DriveBootstrap::new();
        assert!(boot.complete(Ok(fake(1))).is_err());
        assert!(!boot.is_open());
        assert_eq!(boot.begin(None, DriveSource::Created), Decision::Start(None));
    }

    #[test]
    fn only_created_drives_are_answerable_by_default() {
        let mut created = DriveBootstrap::new();
        created.begin(None, DriveSource::Created);
        assert_eq!(created.answerable_key(false), None);
        created.complete(Ok(fake(4))).unwrap();
        assert_eq!(created.answerable_key(false), Some(DriveKey([4; 32])));

        let mut followed = DriveBootstrap::new();
        followed.begin(Some(DriveKey([5; 32])), DriveSource::Peer("dave".into()));
        followed.complete(Ok(fake(5))).unwrap();
        assert_eq!(followed.answerable_key(false), None);
        assert_eq!(followed.answerable_key(true), Some(DriveKey([5; 32])));
    }
}
