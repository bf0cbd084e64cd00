//! Gossip engine (C8): owns the dedup sets, broadcast fan-out, whisper
//! routing and application delivery. Drains the single channel every
//! session reports to (authorization, failure, inbound gossip) and is
//! the only component that holds this node's private sealing key.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::gossip::codec::{Cast, Frame};
use crate::gossip::crypto::seal::{Nonce, SealKeyPair};
use crate::gossip::dedup::DedupSet;
use crate::gossip::manager::Manager;
use crate::gossip::session::SessionEvent;

/// Bound on the embedder's delivery queue. Generous enough that a slow
/// `ReadMessage` consumer does not stall the mesh under ordinary load;
/// the channel applies backpressure to delivery, not to fan-out.
const DELIVERY_QUEUE_CAPACITY: usize = 256;

pub struct GossipEngine {
    manager: Arc<Manager>,
    seal_keypair: Arc<SealKeyPair>,
    /// Guards exactly-once delivery and re-broadcast of every message
    /// id this node has seen, whether it arrived on an inbound link, an
    /// outbound link, or was locally originated. A single shared set is
    /// what makes at-most-once delivery hold across both directions.
    dedup: Mutex<DedupSet>,
    /// Message ids this node originated itself, kept distinct from
    /// `dedup` only for bookkeeping — every id inserted here is also
    /// inserted into `dedup` at the same time.
    origin_dedup: Mutex<DedupSet>,
    delivery_tx: mpsc::Sender<Vec<u8>>,
}

impl GossipEngine {
    /// Builds the engine and the embedder-facing delivery channel.
    /// Returns the engine (already spawnable via [`GossipEngine::run`])
    /// alongside the receiving half `ReadMessage` drains.
    pub fn new(manager: Arc<Manager>, seal_keypair: Arc<SealKeyPair>) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let engine = Arc::new(GossipEngine {
            manager,
            seal_keypair,
            dedup: Mutex::new(DedupSet::default()),
            origin_dedup: Mutex::new(DedupSet::default()),
            delivery_tx,
        });
        (engine, delivery_rx)
    }

    /// Drains session events until every sender is dropped. Spawned
    /// once by `Node::initialize` onto the runtime.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Authorized { id, remote_sign_key, remote_port, .. } => {
                self.manager.on_authorized(id, remote_sign_key, remote_port).await;
            }
            SessionEvent::Failed { id } => {
                tracing::debug!(link = id, "link failed");
            }
            SessionEvent::Gossip { id, whisper, message_id, nonce, ciphertext } => {
                self.handle_gossip(id, whisper, message_id, nonce, ciphertext);
            }
        }
    }

    fn handle_gossip(&self, origin_id: u64, whisper: bool, message_id: Uuid, nonce: Vec<u8>, ciphertext: Vec<u8>) {
        let Some(origin_link) = self.manager.link_by_id(origin_id) else { return };
        let Some(remote_seal_key) = origin_link.remote_seal_key() else { return };
        let Ok(nonce) = Nonce::from_bytes(&nonce) else { return };
        let Ok(plaintext) = self.seal_keypair.open(&remote_seal_key, &nonce, &ciphertext) else {
            tracing::warn!(link = origin_id, "dropping frame that failed to decrypt");
            return;
        };

        let first_time = self.dedup.lock().insert(message_id);
        if !first_time {
            return;
        }

        let _ = self.delivery_tx.try_send(plaintext.clone());

        if !whisper {
            self.fan_out(&plaintext, message_id, Some(origin_id));
        }
    }

    /// Originates a broadcast from the embedder: generates a fresh
    /// message id, delivers it to this node's own queue first (the
    /// self-loopback law), then fans out to every authorized link.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Uuid {
        let message_id = Uuid::new_v4();
        {
            let mut dedup = self.dedup.lock();
            dedup.insert(message_id);
            self.origin_dedup.lock().insert(message_id);
        }
        let _ = self.delivery_tx.send(payload.clone()).await;
        self.fan_out(&payload, message_id, None);
        message_id
    }

    /// Sends `payload` to exactly one authorized peer identified by its
    /// hex-encoded signing key. Returns whether a matching link was
    /// found; the target does not re-broadcast a whisper.
    pub fn whisper(&self, payload: &[u8], target_sign_key_hex: &str) -> bool {
        let Some(link) = self.manager.find_authorized_by_sign_key(target_sign_key_hex) else {
            return false;
        };
        let Some(remote_seal_key) = link.remote_seal_key() else { return false };
        let Ok((nonce, ciphertext)) = self.seal_keypair.seal(&remote_seal_key, payload) else {
            return false;
        };
        let cast = Cast {
            secret: hex::encode(ciphertext),
            nonce: hex::encode(nonce.as_bytes()),
            message_id: Uuid::new_v4(),
        };
        link.send_frame(Frame::Whisper(cast)).is_ok()
    }

    fn fan_out(&self, payload: &[u8], message_id: Uuid, exclude: Option<u64>) {
        for link in self.manager.authorized_links() {
            if Some(link.id) == exclude {
                continue;
            }
            let Some(remote_seal_key) = link.remote_seal_key() else { continue };
            let Ok((nonce, ciphertext)) = self.seal_keypair.seal(&remote_seal_key, payload) else {
                continue;
            };
            let cast = Cast {
                secret: hex::encode(ciphertext),
                nonce: hex::encode(nonce.as_bytes()),
                message_id,
            };
            let _ = link.send_frame(Frame::Broadcast(cast));
        }
    }
}
