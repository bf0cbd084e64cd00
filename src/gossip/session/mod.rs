//! The state machine of a single peer link: handshake, authentication,
//! liveness (ping/pong), receive loop and encrypted send. Both roles
//! (accepting and dialing) execute this state machine; only the
//! accepting side issues the challenge.
//!
//! This module's functions never hold a reference back to the
//! connection manager or the gossip engine: a session reports
//! everything that matters —
//! authorization, failure, an inbound gossip frame — as a
//! [`SessionEvent`] pushed onto a channel. The manager is the
//! exclusive owner of sessions; it decides what to do with those
//! events.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gossip::codec::{Cast, Challenge, Decoded, Frame, Response};
use crate::gossip::crypto::seal::SealPublicKey;
use crate::gossip::crypto::signature::{KeyPair as SigningKeyPair, PublicKey as SignPublicKey};
use crate::gossip::error::*;

/// Who initiated this link.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// The link's position in the handshake/liveness state machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum State {
    Connecting,
    Challenged,
    Authorized,
    Failed,
    Closed,
}

/// Abstraction over the underlying binary duplex channel, so the
/// state machine in this module is agnostic to whether it is driving
/// an inbound axum WebSocket upgrade or an outbound
/// `tokio-tungstenite` client connection.
#[async_trait]
pub trait LinkIo: Send {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Returns `Ok(None)` when the peer closed the channel cleanly.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// An event reported by a session to whoever is driving it (the
/// connection manager). Sessions never reach back into the manager or
/// the gossip engine directly.
pub enum SessionEvent {
    Authorized {
        id: u64,
        remote_sign_key: SignPublicKey,
        remote_seal_key: SealPublicKey,
        remote_host: String,
        remote_port: u16,
    },
    Failed {
        id: u64,
    },
    /// A `broadcast` or `whisper` frame was received on an authorized
    /// link. Decryption happens in the gossip engine, which alone
    /// holds this node's private sealing key and the registry of
    /// remote sealing keys per link; the session only demultiplexes
    /// wire frames and forwards the ciphertext.
    Gossip {
        id: u64,
        whisper: bool,
        message_id: Uuid,
        nonce: Vec<u8>,
        ciphertext: Vec<u8>,
    },
}

/// Shared, thread-safe state describing one link. Owned by the
/// connection manager; sessions are handed an [`Arc`] to it so they
/// can update liveness and state without the manager's registries
/// ever being locked across network I/O.
pub struct LinkHandle {
    pub id: u64,
    pub direction: Direction,
    pub remote_host: String,
    remote_port: AtomicU16,
    state: Mutex<State>,
    alive: AtomicBool,
    remote_sign_key: Mutex<Option<SignPublicKey>>,
    remote_seal_key: Mutex<Option<SealPublicKey>>,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl LinkHandle {
    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn set_state(&self, s: State) {
        *self.state.lock() = s;
    }

    pub fn is_authorized(&self) -> bool {
        self.state() == State::Authorized
    }

    pub fn remote_sign_key(&self) -> Option<SignPublicKey> {
        *self.remote_sign_key.lock()
    }

    pub fn remote_seal_key(&self) -> Option<SealPublicKey> {
        self.remote_seal_key.lock().clone()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port.load(Ordering::SeqCst)
    }

    fn set_remote_port(&self, port: u16) {
        self.remote_port.store(port, Ordering::SeqCst);
    }

    /// Queues `frame` for the link's write serializer. Never blocks on
    /// network I/O: the serializer task owns the transport.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .simple(ErrorKind::Transport)
    }
}

/// Parameters shared by every session run on this node, regardless of
/// direction.
#[derive(Clone)]
pub struct NodeContext {
    pub network_id: Uuid,
    pub signing_key: Arc<SigningKeyPair>,
    pub seal_public_key: SealPublicKey,
    pub listen_port: u16,
}

const AUTH_TIMEOUT: Duration = Duration::from_secs(3);
const PING_PERIOD: Duration = Duration::from_secs(5);

/// Registers the accepting side of the state machine — we issue the
/// challenge, the remote transport dialed us — and spawns its driving
/// loop as an independent task. Returns the link handle immediately so
/// the caller can register it in the connection manager's inbound set
/// while the session is still live.
pub fn spawn_accepting<T>(
    id: u64,
    io: T,
    remote_host: String,
    ctx: NodeContext,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Arc<LinkHandle>
where
    T: LinkIo + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let handle = Arc::new(LinkHandle {
        id,
        direction: Direction::Inbound,
        remote_host,
        remote_port: AtomicU16::new(0),
        state: Mutex::new(State::Challenged),
        alive: AtomicBool::new(true),
        remote_sign_key: Mutex::new(None),
        remote_seal_key: Mutex::new(None),
        outbound: outbound_tx,
    });

    let task_handle = handle.clone();
    tokio::spawn(accepting_loop(task_handle, io, ctx, events, outbound_rx));
    handle
}

async fn accepting_loop<T: LinkIo>(
    handle: Arc<LinkHandle>,
    mut io: T,
    ctx: NodeContext,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let vid = Uuid::new_v4();
    if io.send(frame_bytes(&Frame::Challenge(Challenge { challenge: vid }))).await.is_err() {
        fail(&handle, handle.id, &events);
        return;
    }

    let auth_deadline = Some(tokio::time::Instant::now() + AUTH_TIMEOUT);
    let result = drive_session(&mut io, &handle, &ctx, &events, Some(vid), &mut outbound_rx, auth_deadline).await;
    match result {
        Ok(()) => handle.set_state(State::Closed),
        Err(()) => fail(&handle, handle.id, &events),
    }
}

/// Registers the dialing side of the state machine — we dialed the
/// remote and will answer its challenge — and spawns its driving loop.
/// See [`spawn_accepting`] for why the handle is returned immediately.
pub fn spawn_dialing<T>(
    id: u64,
    io: T,
    remote_host: String,
    remote_port: u16,
    remote_sign_key: SignPublicKey,
    remote_seal_key: SealPublicKey,
    ctx: NodeContext,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> Arc<LinkHandle>
where
    T: LinkIo + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let handle = Arc::new(LinkHandle {
        id,
        direction: Direction::Outbound,
        remote_host,
        remote_port: AtomicU16::new(remote_port),
        state: Mutex::new(State::Connecting),
        alive: AtomicBool::new(true),
        // Learned from the `/info` probe before dialing, since the wire
        // handshake itself only carries the dialing side's identity to
        // the accepting side.
        remote_sign_key: Mutex::new(Some(remote_sign_key)),
        remote_seal_key: Mutex::new(Some(remote_seal_key)),
        outbound: outbound_tx,
    });

    let task_handle = handle.clone();
    tokio::spawn(dialing_loop(task_handle, io, ctx, events, outbound_rx));
    handle
}

async fn dialing_loop<T: LinkIo>(
    handle: Arc<LinkHandle>,
    mut io: T,
    ctx: NodeContext,
    events: mpsc::UnboundedSender<SessionEvent>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let result = drive_session(&mut io, &handle, &ctx, &events, None, &mut outbound_rx, None).await;
    match result {
        Ok(()) => handle.set_state(State::Closed),
        Err(()) => fail(&handle, handle.id, &events),
    }
}

fn fail(handle: &LinkHandle, id: u64, events: &mpsc::UnboundedSender<SessionEvent>) {
    handle.set_state(State::Failed);
    let _ = events.send(SessionEvent::Failed { id });
}

fn frame_bytes(frame: &Frame) -> Vec<u8> {
    frame.encode().unwrap_or_default()
}

/// Resolves once `deadline` passes; never resolves on the dialing side
/// (`deadline` is `None` there, since only the accepting side times
/// out waiting for a signed response).
async fn auth_timeout(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Shared read/write/ping loop for both roles. `our_vid` is `Some` on
/// the accepting side (the value we must see signed back to us);
/// `None` on the dialing side (we instead respond to an incoming
/// `challenge`).
async fn drive_session<T: LinkIo>(
    io: &mut T,
    handle: &Arc<LinkHandle>,
    ctx: &NodeContext,
    events: &mpsc::UnboundedSender<SessionEvent>,
    our_vid: Option<Uuid>,
    outbound_rx: &mut mpsc::UnboundedReceiver<Frame>,
    auth_deadline: Option<tokio::time::Instant>,
) -> std::result::Result<(), ()> {
    let mut ping_due_at = tokio::time::Instant::now() + PING_PERIOD;

    loop {
        tokio::select! {
            biased;

            _ = auth_timeout(auth_deadline), if auth_deadline.is_some() && handle.state() != State::Authorized => {
                return Err(());
            }

            _ = tokio::time::sleep_until(ping_due_at) => {
                if !handle.alive.swap(false, Ordering::SeqCst) {
                    return Err(());
                }
                if io.send(frame_bytes(&Frame::Ping)).await.is_err() {
                    return Err(());
                }
                ping_due_at = tokio::time::Instant::now() + PING_PERIOD;
            }

            outgoing = outbound_rx.recv() => {
                let Some(frame) = outgoing else { return Ok(()) };
                if io.send(frame_bytes(&frame)).await.is_err() {
                    return Err(());
                }
            }

            incoming = io.recv() => {
                let bytes = match incoming {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => return Ok(()),
                    Err(_) => return Err(()),
                };
                match Frame::decode(&bytes) {
                    Ok(Decoded::Unrecognized(_tag)) => { /* logged upstream, ignored */ }
                    Ok(Decoded::Frame(frame)) => {
                        if handle_frame(io, handle, ctx, events, our_vid, frame).await.is_err() {
                            return Err(());
                        }
                    }
                    Err(_) => return Err(()),
                }
            }
        }
    }
}

async fn handle_frame<T: LinkIo>(
    io: &mut T,
    handle: &Arc<LinkHandle>,
    ctx: &NodeContext,
    events: &mpsc::UnboundedSender<SessionEvent>,
    our_vid: Option<Uuid>,
    frame: Frame,
) -> std::result::Result<(), ()> {
    match frame {
        Frame::Ping => {
            io.send(frame_bytes(&Frame::Pong)).await.map_err(|_| ())?;
        }
        Frame::Pong => {
            handle.alive.store(true, Ordering::SeqCst);
        }
        Frame::Challenge(challenge) if our_vid.is_none() => {
            let signed = ctx.signing_key.sign(challenge.challenge.to_string().as_bytes());
            let response = Response {
                signed: hex::encode(signed.as_bytes()),
                sign_key: hex::encode(ctx.signing_key.public_key().as_bytes()),
                seal_key: hex::encode(ctx.seal_public_key.as_bytes()),
                port: ctx.listen_port,
                network_id: ctx.network_id,
            };
            io.send(frame_bytes(&Frame::Response(response)))
                .await
                .map_err(|_| ())?;
        }
        Frame::Response(response) if our_vid.is_some() => {
            let vid = our_vid.unwrap();
            if response.network_id != ctx.network_id {
                return Err(());
            }
            let sign_key_bytes = hex::decode(&response.sign_key).map_err(|_| ())?;
            let seal_key_bytes = hex::decode(&response.seal_key).map_err(|_| ())?;
            let signed_bytes = hex::decode(&response.signed).map_err(|_| ())?;

            let remote_sign_key = SignPublicKey::from_bytes(&sign_key_bytes).map_err(|_| ())?;
            let signature = crate::gossip::crypto::signature::Signature::from_bytes(&signed_bytes)
                .map_err(|_| ())?;
            if !remote_sign_key.verify(vid.to_string().as_bytes(), &signature) {
                return Err(());
            }
            let remote_seal_key = SealPublicKey::from_bytes(&seal_key_bytes).map_err(|_| ())?;

            *handle.remote_sign_key.lock() = Some(remote_sign_key);
            *handle.remote_seal_key.lock() = Some(remote_seal_key.clone());
            handle.set_remote_port(response.port);
            handle.set_state(State::Authorized);

            io.send(frame_bytes(&Frame::Authorized)).await.map_err(|_| ())?;

            let _ = events.send(SessionEvent::Authorized {
                id: handle.id,
                remote_sign_key,
                remote_seal_key,
                remote_host: handle.remote_host.clone(),
                remote_port: response.port,
            });
        }
        Frame::Authorized if our_vid.is_none() => {
            handle.set_state(State::Authorized);
            if let (Some(remote_sign_key), Some(remote_seal_key)) =
                (handle.remote_sign_key(), handle.remote_seal_key())
            {
                let _ = events.send(SessionEvent::Authorized {
                    id: handle.id,
                    remote_sign_key,
                    remote_seal_key,
                    remote_host: handle.remote_host.clone(),
                    remote_port: handle.remote_port(),
                });
            }
        }
        Frame::Broadcast(cast) => {
            if handle.is_authorized() {
                emit_gossip(handle, events, cast, false);
            }
            // Unauthenticated broadcasts are dropped silently upstream;
            // the link itself stays open.
        }
        Frame::Whisper(cast) => {
            if handle.is_authorized() {
                emit_gossip(handle, events, cast, true);
            }
        }
        _ => {
            // A frame arrived out of turn for our role/state. Treat it
            // as a protocol error: the link is not behaving correctly.
            return Err(());
        }
    }
    Ok(())
}


fn emit_gossip(
    handle: &Arc<LinkHandle>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    cast: Cast,
    whisper: bool,
) {
    let (Ok(nonce), Ok(ciphertext)) = (hex::decode(&cast.nonce), hex::decode(&cast.secret)) else {
        return;
    };
    let _ = events.send(SessionEvent::Gossip {
        id: handle.id,
        whisper,
        message_id: cast.message_id,
        nonce,
        ciphertext,
    });
}
