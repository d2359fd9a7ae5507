//! Topic derivation.
//!
//! A room name is hashed into a 32-byte [`Topic`] that every participant of the
//! room computes identically. Hashing the chat topic once more gives the topic
//! under which the shared drive is replicated, so the two rendezvous never
//! collide.

use std::fmt;

use sha2::{Digest, Sha256};

/// Fixed-length rendezvous identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct Topic(pub [u8; 32]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("chat room name must not be empty")]
    EmptyRoom,
}

impl Topic {
    /// Derive the chat topic for `room` from its UTF-8 bytes.
    pub fn for_room(room: &str) -> Result<Self, TopicError> {
        if room.is_empty() {
            return Err(TopicError::EmptyRoom);
        }
        Ok(Self::hash_of(room.as_bytes()))
    }

    /// Topic under which the room's shared drive is replicated.
    pub fn drive_topic(&self) -> Topic {
        Self::hash_of(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn hash_of(bytes: &[u8]) -> Topic {
        Topic(Sha256::digest(bytes).into())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
