//! Ed25519 sign/verify over the UTF-8 bytes of a challenge UUID string.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;

use crate::gossip::error::*;

/// The long-term signing keypair of a node, persisted to disk.
pub struct KeyPair {
    signing_key: SigningKey,
}

/// A peer's public signing key, learned during the handshake.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct PublicKey(VerifyingKey);

/// A detached Ed25519 signature.
#[derive(Copy, Clone)]
pub struct Signature([u8; Signature::LENGTH]);

impl KeyPair {
    pub const PUBLIC_LENGTH: usize = 32;
    pub const SECRET_LENGTH: usize = 32;

    /// Generates a brand new keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair { signing_key }
    }

    /// Reconstructs a keypair from its 32-byte secret scalar.
    pub fn from_bytes(secret: &[u8]) -> Result<Self> {
        let secret: [u8; 32] = secret
            .try_into()
            .simple(ErrorKind::KeyStorage)?;
        Ok(KeyPair {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    /// Returns the raw bytes of the secret scalar, for persistence.
    pub fn secret_bytes(&self) -> [u8; Self::SECRET_LENGTH] {
        self.signing_key.to_bytes()
    }

    /// Returns the public half of this keypair.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key())
    }

    /// Signs `message` (the UTF-8 bytes of a challenge UUID string).
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature(sig.to_bytes())
    }
}

impl PublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let raw: [u8; 32] = raw.try_into().simple(ErrorKind::Protocol)?;
        let key = VerifyingKey::from_bytes(&raw).simple(ErrorKind::Protocol)?;
        Ok(PublicKey(key))
    }

    pub fn as_bytes(&self) -> [u8; Self::LENGTH] {
        self.0.to_bytes()
    }

    /// Verifies `signature` over `message` was produced by this key's
    /// private counterpart.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0.verify(message, &sig).is_ok()
    }
}

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let raw: [u8; Self::LENGTH] = raw.try_into().simple(ErrorKind::Protocol)?;
        Ok(Signature(raw))
    }

    pub fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate();
        let challenge = b"11111111-1111-1111-1111-111111111111";
        let sig = kp.sign(challenge);
        assert!(kp.public_key().verify(challenge, &sig));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let challenge = b"some-challenge";
        let sig = kp.sign(challenge);
        assert!(!other.public_key().verify(challenge, &sig));
    }
}
