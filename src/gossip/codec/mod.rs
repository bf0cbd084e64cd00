//! Wire frames exchanged between two authenticated (or authenticating)
//! peer links. Frames are MessagePack-encoded (`rmp-serde`) over the
//! binary WebSocket channel, mirroring the msgpack framing used by the
//! original implementation this crate supersedes.
//!
//! Decoding is two-pass: first decode just the `type` tag,
//! then re-decode the full payload into the concrete shape that tag
//! names. An unrecognized `type` is not a protocol error — it is
//! logged and the frame is ignored, since future versions of a peer
//! may speak frame types we don't know about yet. A recognized `type`
//! whose payload fails to decode into its concrete shape *is* a
//! protocol error, and fails the owning session.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gossip::error::*;

/// Just enough structure to recover the `type` tag from a frame
/// without committing to any particular payload shape.
#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type")]
    kind: String,
}

/// A decoded frame, or a recognized-but-dropped indication for an
/// unrecognized `type` tag.
pub enum Decoded {
    Frame(Frame),
    Unrecognized(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Challenge {
    pub challenge: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
    /// hex-encoded Ed25519 signature over `challenge`'s UUID string.
    pub signed: String,
    /// hex-encoded Ed25519 public signing key.
    #[serde(rename = "signKey")]
    pub sign_key: String,
    /// hex-encoded X25519 public sealing key.
    #[serde(rename = "sealKey")]
    pub seal_key: String,
    pub port: u16,
    #[serde(rename = "networkID")]
    pub network_id: Uuid,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Cast {
    /// hex-encoded ciphertext.
    pub secret: String,
    /// hex-encoded 24-byte nonce.
    pub nonce: String,
    #[serde(rename = "messageID")]
    pub message_id: Uuid,
}

/// A decoded, tagged wire frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Challenge(Challenge),
    Response(Response),
    Authorized,
    Ping,
    Pong,
    Broadcast(Cast),
    Whisper(Cast),
}

impl Frame {
    fn type_tag(&self) -> &'static str {
        match self {
            Frame::Challenge(_) => "challenge",
            Frame::Response(_) => "response",
            Frame::Authorized => "authorized",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
            Frame::Broadcast(_) => "broadcast",
            Frame::Whisper(_) => "whisper",
        }
    }

    /// Encodes this frame to its wire representation.
    pub fn encode(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Tagged<'a, T: Serialize> {
            #[serde(rename = "type")]
            kind: &'a str,
            #[serde(flatten)]
            body: T,
        }

        #[derive(Serialize)]
        struct Empty;

        let kind = self.type_tag();
        let bytes = match self {
            Frame::Challenge(body) => rmp_serde::to_vec_named(&Tagged { kind, body: body.clone() }),
            Frame::Response(body) => rmp_serde::to_vec_named(&Tagged { kind, body: body.clone() }),
            Frame::Authorized | Frame::Ping | Frame::Pong => {
                rmp_serde::to_vec_named(&Tagged { kind, body: Empty })
            }
            Frame::Broadcast(body) | Frame::Whisper(body) => {
                rmp_serde::to_vec_named(&Tagged { kind, body: body.clone() })
            }
        };
        bytes.wrapped(ErrorKind::Protocol)
    }

    /// Decodes a wire frame. See module docs for the two-pass contract.
    pub fn decode(bytes: &[u8]) -> Result<Decoded> {
        let tag: TypeTag = rmp_serde::from_slice(bytes).wrapped(ErrorKind::Protocol)?;
        let frame = match tag.kind.as_str() {
            "challenge" => Frame::Challenge(rmp_serde::from_slice(bytes).wrapped(ErrorKind::Protocol)?),
            "response" => Frame::Response(rmp_serde::from_slice(bytes).wrapped(ErrorKind::Protocol)?),
            "authorized" => Frame::Authorized,
            "ping" => Frame::Ping,
            "pong" => Frame::Pong,
            "broadcast" => Frame::Broadcast(rmp_serde::from_slice(bytes).wrapped(ErrorKind::Protocol)?),
            "whisper" => Frame::Whisper(rmp_serde::from_slice(bytes).wrapped(ErrorKind::Protocol)?),
            other => return Ok(Decoded::Unrecognized(other.to_string())),
        };
        Ok(Decoded::Frame(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let bytes = frame.encode().expect("encode");
        match Frame::decode(&bytes).expect("decode") {
            Decoded::Frame(f) => f,
            Decoded::Unrecognized(t) => panic!("unexpected unrecognized type {}", t),
        }
    }

    #[test]
    fn challenge_roundtrip() {
        let challenge = Uuid::new_v4();
        match roundtrip(Frame::Challenge(Challenge { challenge })) {
            Frame::Challenge(c) => assert_eq!(c.challenge, challenge),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn authorized_ping_pong_roundtrip() {
        assert!(matches!(roundtrip(Frame::Authorized), Frame::Authorized));
        assert!(matches!(roundtrip(Frame::Ping), Frame::Ping));
        assert!(matches!(roundtrip(Frame::Pong), Frame::Pong));
    }

    #[test]
    fn broadcast_roundtrip() {
        let cast = Cast {
            secret: "abcd".into(),
            nonce: "ef01".into(),
            message_id: Uuid::new_v4(),
        };
        match roundtrip(Frame::Broadcast(cast.clone())) {
            Frame::Broadcast(c) => assert_eq!(c.message_id, cast.message_id),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        #[derive(Serialize)]
        struct Other<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }
        let bytes = rmp_serde::to_vec_named(&Other { kind: "from-the-future" }).unwrap();
        match Frame::decode(&bytes).expect("decode should not fail") {
            Decoded::Unrecognized(t) => assert_eq!(t, "from-the-future"),
            Decoded::Frame(_) => panic!("should not have matched a known frame"),
        }
    }

    #[test]
    fn malformed_known_type_is_an_error() {
        #[derive(Serialize)]
        struct BadResponse<'a> {
            #[serde(rename = "type")]
            kind: &'a str,
        }
        let bytes = rmp_serde::to_vec_named(&BadResponse { kind: "response" }).unwrap();
        assert!(Frame::decode(&bytes).is_err());
    }
}
