//! Whole sessions talking over the in-memory rendezvous.
//!
//! Time is paused, so the drive fallback window elapses only when every
//! session is idle, and instantly when it does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use swarmchat_core::adapters::drive::memory::MemoryDriveFactory;
use swarmchat_core::adapters::memory_swarm::{MemoryNetwork, MemorySwarm};
use swarmchat_core::application::ports::{
    AppEvents, ChatEvent, Discovery, Drive, DriveFactory, JoinOptions, PeerStream, Rendezvous,
};
use swarmchat_core::domain::identity::{DriveKey, PeerKey};
use swarmchat_core::{RoomSession, SessionConfig, Topic};

const PATIENCE: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct ChannelEvents(mpsc::UnboundedSender<ChatEvent>);

#[async_trait]
impl AppEvents for ChannelEvents {
    async fn emit(&self, event: ChatEvent) {
        let _ = self.0.send(event);
    }
}

#[derive(Default)]
struct CountingDrives {
    created: AtomicUsize,
    opened: AtomicUsize,
    open_delay: Duration,
}

impl CountingDrives {
    fn slow_to_open(open_delay: Duration) -> Self {
        Self {
            open_delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl DriveFactory for CountingDrives {
    async fn create(&self) -> anyhow::Result<Arc<dyn Drive>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        MemoryDriveFactory.create().await
    }

    async fn open(&self, key: DriveKey) -> anyhow::Result<Arc<dyn Drive>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        MemoryDriveFactory.open(key).await
    }
}

struct TestPeer {
    fingerprint: String,
    drives: Arc<CountingDrives>,
    input: mpsc::Sender<String>,
    events: mpsc::UnboundedReceiver<ChatEvent>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestPeer {
    fn join(network: &MemoryNetwork, room: &str, name: &str) -> Self {
        Self::join_with(
            SessionConfig::new(room, name),
            Arc::new(MemorySwarm::new(network)),
            Arc::new(CountingDrives::default()),
        )
    }

    fn join_with(
        config: SessionConfig,
        rendezvous: Arc<dyn Rendezvous>,
        drives: Arc<CountingDrives>,
    ) -> Self {
        let fingerprint = rendezvous.local_key().fingerprint();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (input, input_rx) = mpsc::channel(16);

        let session = RoomSession::new(
            config,
            rendezvous,
            drives.clone(),
            Arc::new(ChannelEvents(events_tx)),
        )
        .unwrap();
        let task = tokio::spawn(session.run(input_rx));

        Self {
            fingerprint,
            drives,
            input,
            events,
            task,
        }
    }

    async fn say(&self, line: &str) {
        self.input.send(line.to_string()).await.unwrap();
    }

    /// Wait for the first event matching `wanted`; returns it and everything before it.
    async fn wait_for(
        &mut self,
        wanted: impl Fn(&ChatEvent) -> bool,
    ) -> (ChatEvent, Vec<ChatEvent>) {
        let mut before = Vec::new();
        loop {
            let event = tokio::time::timeout(PATIENCE, self.events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("session ended");
            if wanted(&event) {
                return (event, before);
            }
            before.push(event);
        }
    }

    async fn wait_for_info(&mut self, text: &str) -> Vec<ChatEvent> {
        let wanted = ChatEvent::Info(text.to_string());
        self.wait_for(|e| *e == wanted).await.1
    }

    fn drain(&mut self) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    async fn leave(self) -> Vec<ChatEvent> {
        let Self {
            input,
            mut events,
            task,
            ..
        } = self;
        drop(input);
        task.await.unwrap().unwrap();
        let mut rest = Vec::new();
        while let Some(event) = events.recv().await {
            rest.push(event);
        }
        rest
    }

    fn drives_started(&self) -> usize {
        self.drives.created.load(Ordering::SeqCst) + self.drives.opened.load(Ordering::SeqCst)
    }
}

async fn generated_key(peer: &mut TestPeer) -> String {
    let (event, _) = peer
        .wait_for(|e| e.text().starts_with("Generated new drive with key "))
        .await;
    event
        .text()
        .trim_start_matches("Generated new drive with key ")
        .to_string()
}

/// Rendezvous that hands the room two streams claiming the same remote key.
/// The test keeps the far ends.
struct TwinStreams {
    pending: Mutex<Option<Vec<PeerStream>>>,
    routes: Mutex<Vec<mpsc::UnboundedSender<PeerStream>>>,
}

impl TwinStreams {
    const REMOTE: PeerKey = PeerKey([0xab; 32]);

    fn new() -> (Self, [DuplexStream; 2]) {
        let (near_a, far_a) = tokio::io::duplex(4096);
        let (near_b, far_b) = tokio::io::duplex(4096);
        let streams = [near_a, near_b]
            .into_iter()
            .map(|near| {
                let (reader, writer) = tokio::io::split(near);
                PeerStream {
                    remote_key: Self::REMOTE,
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                }
            })
            .collect();
        let swarm = Self {
            pending: Mutex::new(Some(streams)),
            routes: Mutex::new(Vec::new()),
        };
        (swarm, [far_a, far_b])
    }
}

#[async_trait]
impl Rendezvous for TwinStreams {
    fn local_key(&self) -> PeerKey {
        PeerKey([1; 32])
    }

    async fn join(&self, _topic: Topic, _options: JoinOptions) -> anyhow::Result<Discovery> {
        let (tx, connections) = mpsc::unbounded_channel();
        let (flushed_tx, flushed) = oneshot::channel();
        for stream in self.pending.lock().unwrap().take().unwrap_or_default() {
            tx.send(stream).unwrap();
        }
        self.routes.lock().unwrap().push(tx);
        flushed_tx.send(()).unwrap();
        Ok(Discovery {
            connections,
            flushed,
        })
    }

    async fn leave(&self, _topic: Topic) -> anyhow::Result<()> {
        Ok(())
    }

    async fn destroy(&self) {
        self.routes.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn peers_learn_each_others_names() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    alice.wait_for(|e| e.text().starts_with("Joined chat room lobby")).await;

    let mut bob = TestPeer::join(&network, "lobby", "bob");

    let bob_named = format!("Peer {} is now known as bob", bob.fingerprint);
    let before = alice.wait_for_info(&bob_named).await;
    assert!(before.contains(&ChatEvent::Info(format!("Peer {} joined", bob.fingerprint))));

    let alice_named = format!("Peer {} is now known as alice", alice.fingerprint);
    bob.wait_for_info(&alice_named).await;

    bob.say("hi alice").await;
    let (msg, _) = alice.wait_for(|e| matches!(e, ChatEvent::Message { .. })).await;
    assert_eq!(
        msg,
        ChatEvent::Message {
            from: "bob".into(),
            text: "hi alice".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn lone_peer_creates_exactly_one_drive_after_the_fallback_window() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "solo", "alice");

    alice.wait_for_info("Generating new drive").await;
    let key = generated_key(&mut alice).await;
    assert_eq!(key.len(), 64);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(alice.drives.created.load(Ordering::SeqCst), 1);
    assert_eq!(alice.drives.opened.load(Ordering::SeqCst), 0);

    // Nobody else is in the room, so no connection ever opened.
    assert!(!alice
        .drain()
        .iter()
        .any(|e| e.text().starts_with("Peer ")));
}

#[tokio::test(start_paused = true)]
async fn late_joiner_follows_the_existing_drive() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    let key = generated_key(&mut alice).await;

    let mut bob = TestPeer::join(&network, "lobby", "bob");
    bob.wait_for_info(&format!("Received drive key: {key}")).await;
    bob.wait_for(|e| e.text().starts_with("Drive set from peer")).await;

    alice.say("set greeting hello there").await;
    let stored = ChatEvent::Debug("Value for key: greeting set to: hello there".into());
    alice.wait_for(|e| *e == stored).await;

    let mut replicated = false;
    for _ in 0..20 {
        bob.say("get greeting").await;
        let (answer, _) = bob
            .wait_for(|e| e.text().starts_with("Value for key: greeting is:"))
            .await;
        if answer.text() == "Value for key: greeting is: hello there" {
            replicated = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(replicated, "bob never saw alice's value");

    // Bob's own fallback window passes without a second drive.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!bob
        .drain()
        .contains(&ChatEvent::Info("Generating new drive".into())));
    assert_eq!(bob.drives.created.load(Ordering::SeqCst), 0);
    assert_eq!(bob.drives.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn admin_commands_are_never_broadcast() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    alice.wait_for(|e| e.text().starts_with("Joined chat room")).await;
    let mut bob = TestPeer::join(&network, "lobby", "bob");
    alice
        .wait_for_info(&format!("Peer {} is now known as bob", bob.fingerprint))
        .await;

    alice.say("set foo bar").await;
    alice
        .wait_for(|e| *e == ChatEvent::Error("Drive not ready".into()))
        .await;
    alice.say("set foo").await;
    alice
        .wait_for(|e| *e == ChatEvent::Error("Invalid set command".into()))
        .await;
    alice.say("get a b").await;
    alice
        .wait_for(|e| *e == ChatEvent::Error("Invalid get command".into()))
        .await;
    alice.say("hello").await;

    let (_, before) = bob
        .wait_for(|e| matches!(e, ChatEvent::Message { text, .. } if text == "hello"))
        .await;
    assert!(!before
        .iter()
        .any(|e| matches!(e, ChatEvent::Message { .. })));
}

#[tokio::test(start_paused = true)]
async fn simultaneous_joiners_start_at_most_one_drive_each() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "race", "alice");
    let mut bob = TestPeer::join(&network, "race", "bob");

    // Neither has a drive to offer inside the window, so both fall back.
    generated_key(&mut alice).await;
    generated_key(&mut bob).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(alice.drives_started(), 1);
    assert_eq!(bob.drives_started(), 1);
}

#[tokio::test(start_paused = true)]
async fn departures_are_reported_and_teardown_completes() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    alice.wait_for(|e| e.text().starts_with("Joined chat room")).await;
    let mut bob = TestPeer::join(&network, "lobby", "bob");
    let bob_fp = bob.fingerprint.clone();
    alice
        .wait_for_info(&format!("Peer {bob_fp} is now known as bob"))
        .await;
    bob.wait_for(|e| e.text().ends_with("is now known as alice")).await;

    let bob_tail = bob.leave().await;
    assert!(bob_tail.contains(&ChatEvent::Info("Exiting chat room".into())));

    alice.wait_for_info(&format!("Peer {bob_fp} left")).await;
    let alice_tail = alice.leave().await;
    assert_eq!(
        alice_tail.last(),
        Some(&ChatEvent::Info("Exiting chat room".into()))
    );
}

#[tokio::test(start_paused = true)]
async fn own_messages_are_not_echoed_back() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    alice.wait_for(|e| e.text().starts_with("Joined chat room")).await;
    let mut bob = TestPeer::join(&network, "lobby", "bob");
    alice
        .wait_for_info(&format!("Peer {} is now known as bob", bob.fingerprint))
        .await;
    bob.wait_for(|e| e.text().ends_with("is now known as alice")).await;

    alice.say("hello").await;
    bob.wait_for(|e| matches!(e, ChatEvent::Message { text, .. } if text == "hello"))
        .await;
    bob.say("bye").await;

    let (reply, before) = alice
        .wait_for(|e| matches!(e, ChatEvent::Message { .. }))
        .await;
    assert_eq!(
        reply,
        ChatEvent::Message {
            from: "bob".into(),
            text: "bye".into()
        }
    );
    assert!(!before
        .iter()
        .any(|e| matches!(e, ChatEvent::Message { text, .. } if text == "hello")));
}

#[tokio::test(start_paused = true)]
async fn peer_key_arriving_before_the_fallback_wins() {
    let network = MemoryNetwork::new();
    let mut alice = TestPeer::join(&network, "lobby", "alice");
    let key = generated_key(&mut alice).await;

    // Opening the followed drive outlasts bob's short fallback window.
    let mut config = SessionConfig::new("lobby", "bob");
    config.fallback_delay = Duration::from_secs(1);
    let mut bob = TestPeer::join_with(
        config,
        Arc::new(MemorySwarm::new(&network)),
        Arc::new(CountingDrives::slow_to_open(Duration::from_secs(5))),
    );

    let generating = ChatEvent::Info("Generating new drive".into());
    let mut seen = bob.wait_for_info(&format!("Received drive key: {key}")).await;
    let (_, rest) = bob
        .wait_for(|e| e.text().starts_with("Drive set from peer"))
        .await;
    seen.extend(rest);
    assert!(!seen.contains(&generating));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!bob.drain().contains(&generating));
    assert_eq!(bob.drives_started(), 1);
    assert_eq!(bob.drives.created.load(Ordering::SeqCst), 0);
    assert_eq!(bob.drives.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn second_stream_from_a_connected_peer_is_dropped() {
    let (swarm, [far_a, far_b]) = TwinStreams::new();
    let mut config = SessionConfig::new("lobby", "alice");
    config.fallback_delay = Duration::from_secs(3600);
    let mut alice = TestPeer::join_with(
        config,
        Arc::new(swarm),
        Arc::new(CountingDrives::default()),
    );

    let joined = ChatEvent::Info("Peer ababab joined".into());
    alice.wait_for(|e| *e == joined).await;
    alice.say("hi").await;

    let mut first = BufReader::new(far_a);
    let mut lines = Vec::new();
    while lines.last().map(String::as_str) != Some("hi\n") {
        let mut line = String::new();
        tokio::time::timeout(PATIENCE, first.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        lines.push(line);
    }
    assert_eq!(lines, ["/name?\n", "/drive_key?\n", "hi\n"]);

    // Nothing more arrives on the kept stream, and the duplicate is closed.
    let mut extra = String::new();
    let quiet = tokio::time::timeout(Duration::from_secs(1), first.read_line(&mut extra)).await;
    assert!(quiet.is_err(), "unexpected line {extra:?}");

    let mut second = BufReader::new(far_b);
    let mut line = String::new();
    let read = tokio::time::timeout(PATIENCE, second.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0);

    let tail = alice.leave().await;
    assert!(!tail.contains(&joined));
}
