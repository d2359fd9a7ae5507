//! Quinn-based [`Rendezvous`] adapter.
//!
//! One endpoint per process both accepts and dials. Addresses come from the
//! tracker; every dialled connection carries one bidirectional stream that
//! starts with a hello of `topic (32) || node key (32)`, answered by the
//! acceptor's node key (32). After that the stream belongs to the session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use quinn::{Connection, Endpoint, Incoming, RecvStream, SendStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::codec::CborCodec;
use crate::adapters::crypto::identity::IdentityKeyPair;
use crate::application::ports::{Discovery, JoinOptions, PeerStream, Rendezvous};
use crate::domain::identity::PeerKey;
use crate::domain::topic::Topic;
use crate::domain::tracker::TrackerMsg;

use super::tls;

const HELLO_LEN: usize = 64;

type TopicRoutes = Arc<Mutex<HashMap<Topic, mpsc::UnboundedSender<PeerStream>>>>;

struct TrackerLink {
    connection: Connection,
    send: SendStream,
    recv: RecvStream,
}

// ---------------------------------------------------------------------------
// QuicSwarm
// ---------------------------------------------------------------------------

pub struct QuicSwarm {
    endpoint: Endpoint,
    identity: IdentityKeyPair,
    tracker: Mutex<TrackerLink>,
    routes: TopicRoutes,
    shutdown: CancellationToken,
    codec: CborCodec,
}

impl QuicSwarm {
    /// Bind the local endpoint, connect to the tracker and start accepting.
    pub async fn connect(bind_addr: SocketAddr, tracker_addr: SocketAddr) -> anyhow::Result<Self> {
        let mut endpoint = Endpoint::server(tls::server_config()?, bind_addr)?;
        endpoint.set_default_client_config(tls::client_config()?);
        let identity = IdentityKeyPair::generate();

        info!(%tracker_addr, "Connecting to tracker");
        let connection = endpoint
            .connect(tracker_addr, tls::SERVER_NAME)?
            .await
            .with_context(|| format!("tracker at {tracker_addr} unreachable"))?;
        let (send, recv) = connection.open_bi().await?;
        info!(
            local = %endpoint.local_addr()?,
            key = %identity.peer_key().fingerprint(),
            "Swarm endpoint ready"
        );

        let routes = TopicRoutes::default();
        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            endpoint.clone(),
            Arc::clone(&routes),
            identity.peer_key(),
            shutdown.clone(),
        ));

        Ok(Self {
            endpoint,
            identity,
            tracker: Mutex::new(TrackerLink {
                connection,
                send,
                recv,
            }),
            routes,
            shutdown,
            codec: CborCodec,
        })
    }

    async fn announce(&self, msg: TrackerMsg) -> anyhow::Result<()> {
        let mut link = self.tracker.lock().await;
        self.codec.write_frame(&mut link.send, &msg).await
    }

    async fn lookup(&self, topic: Topic) -> anyhow::Result<Vec<SocketAddr>> {
        let mut link = self.tracker.lock().await;
        self.codec
            .write_frame(&mut link.send, &TrackerMsg::Lookup { topic })
            .await?;
        loop {
            match self.codec.read_frame(&mut link.recv).await? {
                Some(TrackerMsg::Peers { topic: t, peers }) if t == topic => return Ok(peers),
                Some(other) => debug!(?other, "Skipping unexpected tracker frame"),
                None => anyhow::bail!("tracker closed the control stream"),
            }
        }
    }
}

#[async_trait]
impl Rendezvous for QuicSwarm {
    fn local_key(&self) -> PeerKey {
        self.identity.peer_key()
    }

    async fn join(&self, topic: Topic, options: JoinOptions) -> anyhow::Result<Discovery> {
        let (tx, connections) = mpsc::unbounded_channel();
        let (flushed_tx, flushed) = oneshot::channel();

        if options.server {
            self.routes.lock().await.insert(topic, tx.clone());
            self.announce(TrackerMsg::Announce { topic }).await?;
            debug!(?topic, "Announced");
        }

        if !options.client {
            let _ = flushed_tx.send(());
            return Ok(Discovery {
                connections,
                flushed,
            });
        }

        let peers = self.lookup(topic).await?;
        debug!(?topic, count = peers.len(), "Dialling announced peers");

        let endpoint = self.endpoint.clone();
        let local = self.local_key();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut dials = JoinSet::new();
            for addr in peers {
                dials.spawn(dial(endpoint.clone(), addr, topic, local));
            }
            loop {
                let joined = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    joined = dials.join_next() => joined,
                };
                match joined {
                    Some(Ok(Ok(stream))) => {
                        let _ = tx.send(stream);
                    }
                    Some(Ok(Err(e))) => warn!(?topic, "Dial failed: {e:#}"),
                    Some(Err(e)) => warn!(?topic, "Dial task failed: {e}"),
                    None => break,
                }
            }
            let _ = flushed_tx.send(());
        });

        Ok(Discovery {
            connections,
            flushed,
        })
    }

    async fn leave(&self, topic: Topic) -> anyhow::Result<()> {
        let announced = self.routes.lock().await.remove(&topic).is_some();
        if announced {
            self.announce(TrackerMsg::Unannounce { topic }).await?;
        }
        debug!(?topic, "Left topic");
        Ok(())
    }

    async fn destroy(&self) {
        self.shutdown.cancel();
        self.routes.lock().await.clear();
        {
            let link = self.tracker.lock().await;
            link.connection.close(0u32.into(), b"bye");
        }
        self.endpoint.close(0u32.into(), b"bye");
        info!("Swarm destroyed");
    }
}

// ---------------------------------------------------------------------------
// Dialling and accepting
// ---------------------------------------------------------------------------

async fn dial(
    endpoint: Endpoint,
    addr: SocketAddr,
    topic: Topic,
    local: PeerKey,
) -> anyhow::Result<PeerStream> {
    let connection = endpoint.connect(addr, tls::SERVER_NAME)?.await?;
    let (mut send, mut recv) = connection.open_bi().await?;

    let mut hello = [0u8; HELLO_LEN];
    hello[..32].copy_from_slice(&topic.0);
    hello[32..].copy_from_slice(&local.0);
    send.write_all(&hello).await?;

    let mut remote = [0u8; 32];
    recv.read_exact(&mut remote)
        .await
        .with_context(|| format!("{addr} refused topic {topic:?}"))?;

    let remote_key = PeerKey(remote);
    debug!(%addr, peer = %remote_key.fingerprint(), "Dialled peer");
    Ok(PeerStream {
        remote_key,
        reader: Box::new(recv),
        writer: Box::new(send),
    })
}

async fn accept_loop(
    endpoint: Endpoint,
    routes: TopicRoutes,
    local: PeerKey,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let routes = Arc::clone(&routes);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_incoming(incoming, routes, local, shutdown).await {
                debug!("Inbound connection ended: {e}");
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn serve_incoming(
    incoming: Incoming,
    routes: TopicRoutes,
    local: PeerKey,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let connection = incoming.await?;
    let addr = connection.remote_address();
    loop {
        let (send, recv) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            stream = connection.accept_bi() => stream?,
        };
        let routes = Arc::clone(&routes);
        tokio::spawn(async move {
            if let Err(e) = route_stream(send, recv, &routes, local).await {
                warn!(%addr, "Inbound stream dropped: {e}");
            }
        });
    }
}

async fn route_stream(
    mut send: SendStream,
    mut recv: RecvStream,
    routes: &TopicRoutes,
    local: PeerKey,
) -> anyhow::Result<()> {
    let mut hello = [0u8; HELLO_LEN];
    recv.read_exact(&mut hello).await?;
    let mut topic = [0u8; 32];
    let mut remote = [0u8; 32];
    topic.copy_from_slice(&hello[..32]);
    remote.copy_from_slice(&hello[32..]);
    let topic = Topic(topic);

    let route = routes.lock().await.get(&topic).cloned();
    let Some(route) = route else {
        let _ = send.reset(1u32.into());
        let _ = recv.stop(1u32.into());
        anyhow::bail!("not joined to topic {topic:?}");
    };

    send.write_all(&local.0).await?;
    let stream = PeerStream {
        remote_key: PeerKey(remote),
        reader: Box::new(recv),
        writer: Box::new(send),
    };
    if route.send(stream).is_err() {
        anyhow::bail!("topic {topic:?} left while accepting");
    }
    Ok(())
}
