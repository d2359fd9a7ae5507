//! Volatile [`Drive`] adapter.
//!
//! A created drive owns an Ed25519 key pair; its public key is the drive key.
//! Followers only know the public key, so they can verify but not write.
//! Every entry carries the writer's signature and a sequence number, which is
//! all replication needs: an entry is accepted if it verifies against the
//! drive key and is newer than what we hold for that key.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::adapters::codec::CborCodec;
use crate::adapters::crypto::identity::{self, IdentityKeyPair};
use crate::application::ports::{Drive, DriveFactory, PeerStream};
use crate::domain::identity::DriveKey;

/// Pending updates per replication stream before it has to resync.
const UPDATE_BACKLOG: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("drive {0} is read-only on this peer")]
    ReadOnly(DriveKey),
    #[error("remote replicates drive {theirs}, not {ours}")]
    KeyMismatch { ours: DriveKey, theirs: DriveKey },
    #[error("entry {key:?} is not signed by the drive key")]
    BadSignature { key: String },
    #[error("remote closed before identifying its drive")]
    NoHello,
}

/// One signed key-value record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub seq: u64,
    pub signature: Vec<u8>,
}

impl SignedEntry {
    fn signing_payload(drive: &DriveKey, key: &str, value: &[u8], seq: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(32 + 8 + 4 + key.len() + value.len());
        payload.extend_from_slice(&drive.0);
        payload.extend_from_slice(&seq.to_be_bytes());
        payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(value);
        payload
    }

    fn verify(&self, drive: &DriveKey) -> Result<(), DriveError> {
        let payload = Self::signing_payload(drive, &self.key, &self.value, self.seq);
        identity::verify(&drive.0, &payload, &self.signature).map_err(|_| {
            DriveError::BadSignature {
                key: self.key.clone(),
            }
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum ReplicationMsg {
    Hello { drive_key: DriveKey },
    Entry(SignedEntry),
}

#[derive(Default)]
struct Entries {
    by_key: BTreeMap<String, SignedEntry>,
    seq: u64,
}

pub struct MemoryDrive {
    key: DriveKey,
    signer: Option<IdentityKeyPair>,
    entries: RwLock<Entries>,
    updates: broadcast::Sender<SignedEntry>,
    closed: CancellationToken,
    codec: CborCodec,
}

impl MemoryDrive {
    /// New writable drive with a fresh key.
    pub fn create() -> Self {
        let signer = IdentityKeyPair::generate();
        Self::build(signer.drive_key(), Some(signer))
    }

    /// Read-only follower of an existing drive.
    pub fn follow(key: DriveKey) -> Self {
        Self::build(key, None)
    }

    fn build(key: DriveKey, signer: Option<IdentityKeyPair>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BACKLOG);
        Self {
            key,
            signer,
            entries: RwLock::new(Entries::default()),
            updates,
            closed: CancellationToken::new(),
            codec: CborCodec,
        }
    }

    /// Verify and store an entry learned from a peer. Returns whether it was new.
    pub async fn apply(&self, entry: SignedEntry) -> Result<bool, DriveError> {
        entry.verify(&self.key)?;

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.by_key.get(&entry.key) {
            if existing.seq >= entry.seq {
                trace!(key = %entry.key, seq = entry.seq, "Stale entry");
                return Ok(false);
            }
        }
        entries.seq = entries.seq.max(entry.seq);
        entries.by_key.insert(entry.key.clone(), entry.clone());
        drop(entries);

        debug!(key = %entry.key, seq = entry.seq, "Applied replicated entry");
        let _ = self.updates.send(entry);
        Ok(true)
    }

    async fn snapshot(&self) -> Vec<SignedEntry> {
        self.entries.read().await.by_key.values().cloned().collect()
    }

    async fn send_side(
        &self,
        writer: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        mut updates: broadcast::Receiver<SignedEntry>,
    ) -> anyhow::Result<()> {
        for entry in self.snapshot().await {
            self.codec
                .write_frame(writer, &ReplicationMsg::Entry(entry))
                .await?;
        }
        loop {
            match updates.recv().await {
                Ok(entry) => {
                    self.codec
                        .write_frame(writer, &ReplicationMsg::Entry(entry))
                        .await?
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Replication lagged, resending snapshot");
                    for entry in self.snapshot().await {
                        self.codec
                            .write_frame(writer, &ReplicationMsg::Entry(entry))
                            .await?;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    async fn receive_side(
        &self,
        reader: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> anyhow::Result<()> {
        while let Some(msg) = self.codec.read_frame(reader).await? {
            match msg {
                ReplicationMsg::Entry(entry) => {
                    self.apply(entry).await?;
                }
                ReplicationMsg::Hello { .. } => debug!("Duplicate hello ignored"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Drive for MemoryDrive {
    fn key(&self) -> DriveKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.signer.is_some()
    }

    async fn put(&self, key: &str, value: Bytes) -> anyhow::Result<()> {
        let signer = self.signer.as_ref().ok_or(DriveError::ReadOnly(self.key))?;

        let mut entries = self.entries.write().await;
        let seq = entries.seq + 1;
        let payload = SignedEntry::signing_payload(&self.key, key, &value, seq);
        let entry = SignedEntry {
            key: key.to_string(),
            value: value.to_vec(),
            seq,
            signature: signer.sign(&payload),
        };
        entries.seq = seq;
        entries.by_key.insert(entry.key.clone(), entry.clone());
        drop(entries);

        debug!(%key, seq, "Drive: put done");
        let _ = self.updates.send(entry);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        let entries = self.entries.read().await;
        Ok(entries
            .by_key
            .get(key)
            .map(|e| Bytes::from(e.value.clone())))
    }

    async fn replicate(&self, stream: PeerStream) -> anyhow::Result<()> {
        let PeerStream {
            remote_key,
            mut reader,
            mut writer,
        } = stream;
        let peer = remote_key.fingerprint();

        // Subscribe before the snapshot is taken so nothing falls in between.
        let updates = self.updates.subscribe();

        self.codec
            .write_frame(
                &mut *writer,
                &ReplicationMsg::Hello {
                    drive_key: self.key,
                },
            )
            .await?;
        match self.codec.read_frame(&mut *reader).await? {
            Some(ReplicationMsg::Hello { drive_key }) if drive_key == self.key => {}
            Some(ReplicationMsg::Hello { drive_key }) => {
                return Err(DriveError::KeyMismatch {
                    ours: self.key,
                    theirs: drive_key,
                }
                .into())
            }
            Some(ReplicationMsg::Entry(_)) | None => return Err(DriveError::NoHello.into()),
        }
        info!(%peer, key = %self.key, "Drive replication started");

        let result = tokio::select! {
            _ = self.closed.cancelled() => Ok(()),
            sent = self.send_side(&mut *writer, updates) => sent,
            received = self.receive_side(&mut *reader) => received,
        };
        debug!(%peer, "Drive replication stopped");
        result
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Creates and follows [`MemoryDrive`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDriveFactory;

#[async_trait]
impl DriveFactory for MemoryDriveFactory {
    async fn create(&self) -> anyhow::Result<Arc<dyn Drive>> {
        Ok(Arc::new(MemoryDrive::create()))
    }

    async fn open(&self, key: DriveKey) -> anyhow::Result<Arc<dyn Drive>> {
        Ok(Arc::new(MemoryDrive::follow(key)))
    }
}
