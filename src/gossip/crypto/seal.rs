//! X25519 authenticated box (curve25519 + XSalsa20-Poly1305), used to
//! seal every gossiped payload for a single recipient's ephemeral
//! sealing key. Analogous to `golang.org/x/crypto/nacl/box` in the
//! original implementation this crate supersedes.

use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::{PublicKey, SalsaBox, SecretKey};

use crate::gossip::error::*;

/// A 24-byte nonce, generated fresh for every sealed message.
#[derive(Clone)]
pub struct Nonce(crypto_box::Nonce);

impl Nonce {
    pub const LENGTH: usize = 24;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() != Self::LENGTH {
            return Err("nonce has an invalid length").simple_msg(ErrorKind::Crypto, "bad nonce length");
        }
        Ok(Nonce(*crypto_box::Nonce::from_slice(raw)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// The ephemeral X25519 sealing keypair generated once per process.
pub struct SealKeyPair {
    secret: SecretKey,
    public: SealPublicKey,
}

/// A peer's public sealing key, learned during the handshake.
#[derive(Clone)]
pub struct SealPublicKey(PublicKey);

impl SealKeyPair {
    pub const LENGTH: usize = 32;

    /// Generates a fresh ephemeral sealing keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let secret = SecretKey::generate(&mut OsRng);
        let public = SealPublicKey(secret.public_key());
        SealKeyPair { secret, public }
    }

    pub fn public_key(&self) -> SealPublicKey {
        self.public.clone()
    }

    /// Seals `plaintext` for `recipient`, using a freshly generated
    /// nonce. Returns the nonce alongside the ciphertext so both can
    /// be carried in the wire frame.
    pub fn seal(&self, recipient: &SealPublicKey, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        let sealed_box = SalsaBox::new(&recipient.0, &self.secret);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ciphertext = sealed_box
            .encrypt(&nonce, plaintext)
            .simple(ErrorKind::Crypto)?;
        Ok((Nonce(nonce), ciphertext))
    }

    /// Opens a box sealed by `sender` using `nonce`. Failure is not
    /// fatal to the owning link: the caller logs and drops the frame.
    pub fn open(&self, sender: &SealPublicKey, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let sealed_box = SalsaBox::new(&sender.0, &self.secret);
        sealed_box
            .decrypt(&nonce.0, ciphertext)
            .simple(ErrorKind::Crypto)
    }
}

impl SealPublicKey {
    pub const LENGTH: usize = 32;

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let raw: [u8; Self::LENGTH] = raw.try_into().simple(ErrorKind::Protocol)?;
        Ok(SealPublicKey(PublicKey::from(raw)))
    }

    pub fn as_bytes(&self) -> [u8; Self::LENGTH] {
        *self.0.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_roundtrip() {
        let sender = SealKeyPair::generate();
        let recipient = SealKeyPair::generate();

        let plaintext = b"hello from the mesh";
        let (nonce, ciphertext) = sender.seal(&recipient.public_key(), plaintext).unwrap();

        let opened = recipient
            .open(&sender.public_key(), &nonce, &ciphertext)
            .unwrap();
        assert_eq!(&opened[..], &plaintext[..]);
    }

    #[test]
    fn open_fails_with_wrong_key() {
        let sender = SealKeyPair::generate();
        let recipient = SealKeyPair::generate();
        let impostor = SealKeyPair::generate();

        let (nonce, ciphertext) = sender.seal(&recipient.public_key(), b"secret").unwrap();
        assert!(impostor.open(&sender.public_key(), &nonce, &ciphertext).is_err());
    }
}
