//! Ed25519 key pairs for node identities and drive signing.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::domain::identity::{DriveKey, PeerKey};

/// A long-lived Ed25519 key pair.
pub struct IdentityKeyPair {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity (random).
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying.to_bytes()
    }

    /// Domain-typed node key, presented to peers during the hello.
    pub fn peer_key(&self) -> PeerKey {
        PeerKey(self.public_bytes())
    }

    /// Domain-typed drive key, for a drive this pair signs.
    pub fn drive_key(&self) -> DriveKey {
        DriveKey(self.public_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

/// Check `signature` over `message` against a raw 32-byte public key.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8]) -> anyhow::Result<()> {
    let verifying = VerifyingKey::from_bytes(public)?;
    let signature = Signature::from_slice(signature)?;
    verifying.verify(message, &signature)?;
    Ok(())
}
