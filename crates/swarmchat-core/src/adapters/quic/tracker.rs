//! Quinn-based topic tracker.
//!
//! Peers keep one control stream open to the tracker. Announcing a topic
//! records the address the tracker observes for that connection; a lookup
//! returns every other announced address. Announcements live exactly as long
//! as the connection that made them.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quinn::{Connection, Endpoint};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::adapters::codec::CborCodec;
use crate::domain::topic::Topic;
use crate::domain::tracker::TrackerMsg;

use super::tls;

// ---------------------------------------------------------------------------
// Announcement table
// ---------------------------------------------------------------------------

/// Which connection announced which topic, and from where.
#[derive(Debug, Default)]
pub struct TopicTable {
    topics: HashMap<Topic, BTreeMap<u64, SocketAddr>>,
}

impl TopicTable {
    pub fn announce(&mut self, conn: u64, addr: SocketAddr, topic: Topic) {
        self.topics.entry(topic).or_default().insert(conn, addr);
    }

    pub fn unannounce(&mut self, conn: u64, topic: &Topic) {
        if let Some(peers) = self.topics.get_mut(topic) {
            peers.remove(&conn);
            if peers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    /// Announced addresses for `topic`, excluding `requester`'s own.
    pub fn lookup(&self, topic: &Topic, requester: u64) -> Vec<SocketAddr> {
        self.topics
            .get(topic)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|(conn, _)| **conn != requester)
                    .map(|(_, addr)| *addr)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Forget everything `conn` announced. Returns how many topics it had.
    pub fn drop_connection(&mut self, conn: u64) -> usize {
        let mut dropped = 0;
        self.topics.retain(|_, peers| {
            if peers.remove(&conn).is_some() {
                dropped += 1;
            }
            !peers.is_empty()
        });
        dropped
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

// ---------------------------------------------------------------------------
// Tracker server
// ---------------------------------------------------------------------------

pub struct TrackerServer {
    endpoint: Endpoint,
    table: Mutex<TopicTable>,
    next_conn: AtomicU64,
    codec: CborCodec,
}

impl TrackerServer {
    /// Create and bind the tracker.
    pub fn bind(bind_addr: SocketAddr) -> anyhow::Result<Self> {
        let endpoint = Endpoint::server(tls::server_config()?, bind_addr)?;
        info!(addr = %endpoint.local_addr()?, "Tracker listening");

        Ok(Self {
            endpoint,
            table: Mutex::new(TopicTable::default()),
            next_conn: AtomicU64::new(1),
            codec: CborCodec,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Run the accept loop until the endpoint is closed.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        while let Some(incoming) = self.endpoint.accept().await {
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => server.handle_connection(conn).await,
                    Err(e) => warn!("Failed to accept connection: {e}"),
                }
            });
        }
        Ok(())
    }

    pub fn close(&self) {
        self.endpoint.close(0u32.into(), b"tracker shutting down");
    }

    async fn handle_connection(&self, connection: Connection) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let addr = connection.remote_address();
        info!(conn_id, %addr, "Peer connected");

        if let Err(e) = self.serve(conn_id, addr, &connection).await {
            debug!(conn_id, "Control stream ended: {e}");
        }

        let dropped = self.table.lock().await.drop_connection(conn_id);
        info!(conn_id, %addr, dropped, "Peer disconnected");
    }

    async fn serve(
        &self,
        conn_id: u64,
        addr: SocketAddr,
        connection: &Connection,
    ) -> anyhow::Result<()> {
        let (mut send, mut recv) = connection.accept_bi().await?;

        while let Some(msg) = self.codec.read_frame::<_, TrackerMsg>(&mut recv).await? {
            match msg {
                TrackerMsg::Announce { topic } => {
                    debug!(conn_id, ?topic, "Announce");
                    self.table.lock().await.announce(conn_id, addr, topic);
                }
                TrackerMsg::Unannounce { topic } => {
                    debug!(conn_id, ?topic, "Unannounce");
                    self.table.lock().await.unannounce(conn_id, &topic);
                }
                TrackerMsg::Lookup { topic } => {
                    let peers = self.table.lock().await.lookup(&topic, conn_id);
                    debug!(conn_id, ?topic, found = peers.len(), "Lookup");
                    self.codec
                        .write_frame(&mut send, &TrackerMsg::Peers { topic, peers })
                        .await?;
                }
                TrackerMsg::Peers { .. } => {
                    warn!(conn_id, "Ignoring Peers sent to the tracker");
                }
            }
        }
        Ok(())
    }
}
