//! Cryptographic primitives traded between peer links: long-term
//! Ed25519 signing keys authenticate the challenge/response handshake,
//! ephemeral X25519 sealing keys protect every gossiped payload.

pub mod seal;
pub mod signature;
