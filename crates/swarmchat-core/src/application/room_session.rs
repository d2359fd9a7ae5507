//! RoomSession use case — joins a room and runs its event loop.
//!
//! Startup: derive the topic, join the rendezvous as client and server, wait
//! for the initial discovery pass, arm the drive fallback timer, then serve
//! events until local input closes.
//!
//! All session state (registry, handshake, drive bootstrap) lives in
//! this struct and is only touched from [`RoomSession::run`]. Spawned tasks
//! (connection readers/writers, discovery, timer, drive init) talk to the loop
//! exclusively through [`RoomEvent`]s.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::identity::{ConnId, DriveKey, PeerKey};
use crate::domain::topic::Topic;

use super::drive_bootstrap::{initialize_drive, Decision, DriveBootstrap, DriveSource};
use super::handshake::Handshake;
use super::local_command::{CommandError, LocalInput};
use super::ports::{
    AppEvents, ChatEvent, Discovery, Drive, DriveFactory, JoinOptions, PeerStream, Rendezvous,
};
use super::registry::ConnectionRegistry;
use super::router;

/// Fallback window before a session creates its own drive.
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(10);

/// Longest chat or control line accepted from a peer, terminator excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room: String,
    pub display_name: String,
    /// How long to wait for a peer-supplied drive key before creating one.
    pub fallback_delay: Duration,
    /// Answer `/drive_key?` with the key of a drive we merely follow.
    pub relay_followed_drive_key: bool,
}

impl SessionConfig {
    pub fn new(room: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            display_name: display_name.into(),
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            relay_followed_drive_key: false,
        }
    }
}

/// Everything the event loop reacts to.
enum RoomEvent {
    ConnectionOpened(PeerStream),
    LineReceived { id: ConnId, line: String },
    ConnectionClosed { id: ConnId, error: Option<io::Error> },
    FallbackTimerFired,
    DriveInitialized(anyhow::Result<Arc<dyn Drive>>),
}

pub struct RoomSession {
    config: SessionConfig,
    topic: Topic,
    rendezvous: Arc<dyn Rendezvous>,
    drives: Arc<dyn DriveFactory>,
    app_events: Arc<dyn AppEvents>,
    registry: ConnectionRegistry,
    handshake: Handshake,
    bootstrap: DriveBootstrap,
    next_conn_id: u64,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    events_rx: mpsc::UnboundedReceiver<RoomEvent>,
    shutdown: CancellationToken,
}

impl RoomSession {
    /// Fails if the room name is empty.
    pub fn new(
        config: SessionConfig,
        rendezvous: Arc<dyn Rendezvous>,
        drives: Arc<dyn DriveFactory>,
        app_events: Arc<dyn AppEvents>,
    ) -> anyhow::Result<Self> {
        let topic = Topic::for_room(&config.room)?;
        let handshake = Handshake::new(
            config.display_name.clone(),
            config.relay_followed_drive_key,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            topic,
            rendezvous,
            drives,
            app_events,
            registry: ConnectionRegistry::new(),
            handshake,
            bootstrap: DriveBootstrap::new(),
            next_conn_id: 1,
            events_tx,
            events_rx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Join the room and serve it until `input` closes, then tear down.
    pub async fn run(mut self, mut input: mpsc::Receiver<String>) -> anyhow::Result<()> {
        self.join().await?;
        self.arm_fallback_timer();

        loop {
            tokio::select! {
                line = input.recv() => match line {
                    Some(line) => self.on_input(line).await,
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
            }
        }

        self.teardown().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Startup / teardown
    // -----------------------------------------------------------------------

    async fn join(&mut self) -> anyhow::Result<()> {
        let room = self.config.room.clone();
        let topic_hex = self.topic.to_hex();
        self.emit(ChatEvent::Info(format!(
            "Joining chat room {room} ({topic_hex})"
        )))
        .await;

        let Discovery {
            mut connections,
            flushed,
        } = self.rendezvous.join(self.topic, JoinOptions::BOTH).await?;

        let tx = self.events_tx.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    next = connections.recv() => match next {
                        Some(stream) => stream,
                        None => break,
                    },
                };
                if tx.send(RoomEvent::ConnectionOpened(stream)).is_err() {
                    break;
                }
            }
        });

        let _ = flushed.await;
        info!(topic = ?self.topic, "Joined chat room");
        self.emit(ChatEvent::Info(format!(
            "Joined chat room {room} ({topic_hex})"
        )))
        .await;
        Ok(())
    }

    fn arm_fallback_timer(&self) {
        let tx = self.events_tx.clone();
        let shutdown = self.shutdown.clone();
        let delay = self.config.fallback_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(RoomEvent::FallbackTimerFired);
                }
            }
        });
    }

    async fn teardown(&mut self) {
        self.emit(ChatEvent::Info("Exiting chat room".into())).await;
        self.shutdown.cancel();
        self.registry.close_all();
        if let Err(e) = self.rendezvous.leave(self.topic).await {
            warn!("Failed to leave chat topic: {e:#}");
        }
        self.bootstrap.close().await;
        self.rendezvous.destroy().await;
        info!("Session closed");
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    async fn on_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::ConnectionOpened(stream) => self.on_connection(stream).await,

            RoomEvent::LineReceived { id, line } => {
                let outcome = router::dispatch(
                    id,
                    line,
                    &self.handshake,
                    &mut self.registry,
                    &mut self.bootstrap,
                );
                for event in outcome.events {
                    self.emit(event).await;
                }
                if let Some(key) = outcome.start_drive {
                    self.spawn_drive_init(Some(key));
                }
            }

            RoomEvent::ConnectionClosed { id, error } => self.on_closed(id, error).await,

            RoomEvent::FallbackTimerFired => {
                if self.bootstrap.is_open() {
                    debug!("Fallback timer fired, drive already open");
                    return;
                }
                match self.bootstrap.begin(None, DriveSource::Created) {
                    Decision::Start(_) => {
                        self.emit(ChatEvent::Info("Generating new drive".into()))
                            .await;
                        self.spawn_drive_init(None);
                    }
                    other => debug!(?other, "Fallback timer fired, nothing to do"),
                }
            }

            RoomEvent::DriveInitialized(result) => self.on_drive_initialized(result).await,
        }
    }

    async fn on_connection(&mut self, stream: PeerStream) {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;

        let PeerStream {
            remote_key,
            reader,
            writer,
        } = stream;

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        if !self.registry.register(id, remote_key, outbox_tx) {
            // Dropping both halves closes the duplicate stream.
            debug!(%id, peer = %remote_key.fingerprint(), "Duplicate connection dropped");
            return;
        }
        info!(%id, peer = %remote_key.fingerprint(), "Connection opened");
        self.emit(ChatEvent::Info(format!(
            "Peer {} joined",
            remote_key.fingerprint()
        )))
        .await;

        spawn_writer(id, writer, outbox_rx, self.shutdown.clone());
        spawn_reader(id, reader, self.events_tx.clone(), self.shutdown.clone());
        self.registry.mark_open(id);

        self.handshake.on_open(id, &self.registry, &self.bootstrap);
    }

    async fn on_closed(&mut self, id: ConnId, error: Option<io::Error>) {
        let Some(remote_key) = self.registry.remove(id) else {
            return;
        };
        let event = departure_event(remote_key, error);
        self.emit(event).await;
    }

    fn spawn_drive_init(&self, key: Option<DriveKey>) {
        let tx = self.events_tx.clone();
        let rendezvous = Arc::clone(&self.rendezvous);
        let drives = Arc::clone(&self.drives);
        let drive_topic = self.topic.drive_topic();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let result = initialize_drive(rendezvous, drives, drive_topic, key, shutdown).await;
            let _ = tx.send(RoomEvent::DriveInitialized(result));
        });
    }

    async fn on_drive_initialized(&mut self, result: anyhow::Result<Arc<dyn Drive>>) {
        let source = self.bootstrap.source().cloned();
        let event = match (self.bootstrap.complete(result), source) {
            (Ok(()), Some(DriveSource::Created)) => {
                let key = self.bootstrap.drive().map(|d| d.key().to_hex());
                ChatEvent::Info(format!(
                    "Generated new drive with key {}",
                    key.unwrap_or_default()
                ))
            }
            (Ok(()), Some(DriveSource::Peer(label))) => {
                ChatEvent::Info(format!("Drive set from peer {label}"))
            }
            (Ok(()), None) => return,
            (Err(_), Some(DriveSource::Created)) => {
                ChatEvent::Error("Error generating new drive".into())
            }
            (Err(e), _) => ChatEvent::Error(format!("Error joining drive: {e:#}")),
        };
        self.emit(event).await;
    }

    // -----------------------------------------------------------------------
    // Local input
    // -----------------------------------------------------------------------

    async fn on_input(&mut self, line: String) {
        let input = match LocalInput::parse(&line) {
            Ok(input) => input,
            Err(e) => return self.emit(ChatEvent::Error(e.to_string())).await,
        };

        match input {
            LocalInput::Chat(text) => {
                if text.is_empty() {
                    return;
                }
                let sent = self.registry.broadcast(&text);
                debug!(sent, "Broadcast chat line");
            }

            LocalInput::Set { key, value } => {
                let Some(drive) = self.bootstrap.drive().cloned() else {
                    return self.emit(ChatEvent::Error(CommandError::NoDrive.to_string())).await;
                };
                self.emit(ChatEvent::Debug(format!(
                    "Setting key: {key} to value: {value}"
                )))
                .await;
                let event = match drive.put(&key, Bytes::from(value.clone())).await {
                    Ok(()) => ChatEvent::Debug(format!("Value for key: {key} set to: {value}")),
                    Err(e) => {
                        warn!(%key, "Drive put failed: {e:#}");
                        ChatEvent::Error(format!("Error setting value for key: {key}"))
                    }
                };
                self.emit(event).await;
            }

            LocalInput::Get { key } => {
                let Some(drive) = self.bootstrap.drive().cloned() else {
                    return self.emit(ChatEvent::Error(CommandError::NoDrive.to_string())).await;
                };
                self.emit(ChatEvent::Debug(format!("Getting value for key: {key}")))
                    .await;
                let event = match drive.get(&key).await {
                    Ok(Some(value)) => ChatEvent::Debug(format!(
                        "Value for key: {key} is: {}",
                        String::from_utf8_lossy(&value)
                    )),
                    Ok(None) => ChatEvent::Debug(format!("Value for key: {key} is: <unset>")),
                    Err(e) => {
                        warn!(%key, "Drive get failed: {e:#}");
                        ChatEvent::Error(format!("Error getting value for key: {key}"))
                    }
                };
                self.emit(event).await;
            }
        }
    }

    async fn emit(&self, event: ChatEvent) {
        self.app_events.emit(event).await;
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

fn spawn_reader(
    id: ConnId,
    reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>,
    events: mpsc::UnboundedSender<RoomEvent>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let error = loop {
            buf.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = read_record(&mut reader, &mut buf) => read,
            };
            match read {
                Ok(0) => break None,
                Ok(_) => {
                    let line = router::decode_line(&buf);
                    if events.send(RoomEvent::LineReceived { id, line }).is_err() {
                        return;
                    }
                }
                Err(e) => break Some(e),
            }
        };
        let _ = events.send(RoomEvent::ConnectionClosed { id, error });
    });
}

/// Read one `\n`-terminated record into `buf`, terminator included.
///
/// A record longer than [`MAX_LINE_LEN`] is an `InvalidData` error. `Ok(0)`
/// means the stream ended cleanly.
async fn read_record<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let limit = MAX_LINE_LEN as u64 + 1;
    let read = reader.take(limit).read_until(b'\n', buf).await?;
    if buf.len() > MAX_LINE_LEN && buf.last() != Some(&b'\n') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("line exceeds {MAX_LINE_LEN} bytes"),
        ));
    }
    Ok(read)
}

fn spawn_writer(
    id: ConnId,
    mut writer: Box<dyn tokio::io::AsyncWrite + Send + Unpin>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = outbox.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            let mut record = line.into_bytes();
            record.push(b'\n');
            if let Err(e) = write_record(&mut writer, &record).await {
                debug!(%id, "Write failed: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });
}

async fn write_record(
    writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
    record: &[u8],
) -> io::Result<()> {
    writer.write_all(record).await?;
    writer.flush().await
}

/// Ordinary departures are informational; anything else is an error.
fn departure_event(remote_key: PeerKey, error: Option<io::Error>) -> ChatEvent {
    let peer = remote_key.fingerprint();
    match error {
        None => ChatEvent::Info(format!("Peer {peer} left")),
        Some(e) if is_departure(&e) => ChatEvent::Info(format!("Peer {peer} left")),
        Some(e) => ChatEvent::Error(format!("Connection error: {e} ({:?})", e.kind())),
    }
}

fn is_departure(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
