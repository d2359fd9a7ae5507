//! Domain identifiers and key-related value types.
//!
//! These are **pure data** — no I/O, no framework dependencies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Local handle for one peer connection, unique for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Key material value objects
// ---------------------------------------------------------------------------

/// Number of hex characters shown when a peer is identified by its key.
pub const FINGERPRINT_LEN: usize = 6;

/// A remote node's 32-byte public key, as presented by the rendezvous substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerKey(pub [u8; 32]);

impl PeerKey {
    /// Short display label: the first [`FINGERPRINT_LEN`] hex characters of the key.
    pub fn fingerprint(&self) -> String {
        let mut hex = hex::encode(&self.0[..FINGERPRINT_LEN.div_ceil(2)]);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Public key of a shared drive. Whoever knows it can follow the drive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriveKey(pub [u8; 32]);

impl DriveKey {
    /// Length of the hexadecimal form carried in `/drive_key=` assertions.
    pub const HEX_LEN: usize = 64;

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DriveKey({})", self.to_hex())
    }
}

impl fmt::Display for DriveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Rejected textual drive key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriveKeyParseError {
    #[error("drive key must be {expected} hex characters, got {0}", expected = DriveKey::HEX_LEN)]
    Length(usize),
    #[error("drive key is not valid hex")]
    NotHex,
}

impl FromStr for DriveKey {
    type Err = DriveKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != Self::HEX_LEN {
            return Err(DriveKeyParseError::Length(s.len()));
        }
        let mut key = [0u8; 32];
        hex::decode_to_slice(s, &mut key).map_err(|_| DriveKeyParseError::NotHex)?;
        Ok(Self(key))
    }
}
