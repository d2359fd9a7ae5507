//! In-process [`Rendezvous`] adapter.
//!
//! Every [`MemorySwarm`] attached to the same [`MemoryNetwork`] is one
//! participant. Joining a topic as a client pairs the joiner with each member
//! that joined it as a server, using an in-memory duplex pipe per pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::application::ports::{Discovery, JoinOptions, PeerStream, Rendezvous};
use crate::domain::identity::PeerKey;
use crate::domain::topic::Topic;

/// Buffer size of each in-memory pipe direction.
const PIPE_CAPACITY: usize = 64 * 1024;

struct Member {
    swarm_id: u64,
    key: PeerKey,
    connections: mpsc::UnboundedSender<PeerStream>,
}

/// Shared hub the in-memory swarms meet in.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    topics: Arc<Mutex<HashMap<Topic, Vec<Member>>>>,
    next_swarm_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct MemorySwarm {
    network: MemoryNetwork,
    swarm_id: u64,
    key: PeerKey,
}

impl MemorySwarm {
    pub fn new(network: &MemoryNetwork) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self {
            network: network.clone(),
            swarm_id: network.next_swarm_id.fetch_add(1, Ordering::Relaxed),
            key: PeerKey(key),
        }
    }
}

fn pipe(remote_key: PeerKey, stream: tokio::io::DuplexStream) -> PeerStream {
    let (reader, writer) = tokio::io::split(stream);
    PeerStream {
        remote_key,
        reader: Box::new(reader),
        writer: Box::new(writer),
    }
}

#[async_trait]
impl Rendezvous for MemorySwarm {
    fn local_key(&self) -> PeerKey {
        self.key
    }

    async fn join(&self, topic: Topic, options: JoinOptions) -> anyhow::Result<Discovery> {
        let (tx, connections) = mpsc::unbounded_channel();
        let (flushed_tx, flushed) = oneshot::channel();

        let mut topics = self.network.topics.lock().await;
        let members = topics.entry(topic).or_default();
        members.retain(|m| !m.connections.is_closed());

        if options.client {
            for member in members.iter().filter(|m| m.swarm_id != self.swarm_id) {
                let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                if member.connections.send(pipe(self.key, theirs)).is_err() {
                    continue;
                }
                debug!(?topic, peer = %member.key.fingerprint(), "Paired in memory");
                let _ = tx.send(pipe(member.key, ours));
            }
        }

        if options.server {
            members.push(Member {
                swarm_id: self.swarm_id,
                key: self.key,
                connections: tx,
            });
        }

        let _ = flushed_tx.send(());
        Ok(Discovery {
            connections,
            flushed,
        })
    }

    async fn leave(&self, topic: Topic) -> anyhow::Result<()> {
        let mut topics = self.network.topics.lock().await;
        if let Some(members) = topics.get_mut(&topic) {
            members.retain(|m| m.swarm_id != self.swarm_id);
        }
        Ok(())
    }

    async fn destroy(&self) {
        let mut topics = self.network.topics.lock().await;
        for members in topics.values_mut() {
            members.retain(|m| m.swarm_id != self.swarm_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn client_is_paired_with_existing_servers_only() {
        let network = MemoryNetwork::new();
        let topic = Topic::for_room("lobby").unwrap();

        let a = MemorySwarm::new(&network);
        let b = MemorySwarm::new(&network);
        let c = MemorySwarm::new(&network);

        let mut da = a.join(topic, JoinOptions::BOTH).await.unwrap();
        let mut dc = c
            .join(topic, JoinOptions { client: true, server: false })
            .await
            .unwrap();
        let mut db = b.join(topic, JoinOptions::BOTH).await.unwrap();

        // c only dials, and a was the only server when it joined.
        let c_to_a = dc.connections.recv().await.unwrap();
        assert_eq!(c_to_a.remote_key, a.local_key());

        // b dials a (c is not a server).
        let mut b_to_a = db.connections.recv().await.unwrap();
        assert_eq!(b_to_a.remote_key, a.local_key());
        assert!(db.connections.try_recv().is_err());

        let _a_from_c = da.connections.recv().await.unwrap();
        let mut a_from_b = da.connections.recv().await.unwrap();
        assert_eq!(a_from_b.remote_key, b.local_key());

        b_to_a.writer.write_all(b"hi\n").await.unwrap();
        let mut buf = [0u8; 3];
        a_from_b.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi\n");
    }

    #[tokio::test]
    async fn left_members_are_not_dialled() {
        let network = MemoryNetwork::new();
        let topic = Topic::for_room("lobby").unwrap();
        let a = MemorySwarm::new(&network);
        let b = MemorySwarm::new(&network);

        let _da = a.join(topic, JoinOptions::BOTH).await.unwrap();
        a.leave(topic).await.unwrap();

        let mut db = b.join(topic, JoinOptions::BOTH).await.unwrap();
        db.flushed.await.unwrap();
        assert!(db.connections.try_recv().is_err());
    }
}
