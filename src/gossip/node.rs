//! The embedder-facing handle: `Node::initialize`, `Broadcast`,
//! `Whisper`, `ReadMessage`, `GetPeerList`. Wires together the
//! directory, connection manager, gossip engine, HTTP/WS transport and
//! discovery loop described by the rest of this crate.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::gossip::config::Config;
use crate::gossip::crypto::seal::SealKeyPair;
use crate::gossip::directory::{Directory, Peer};
use crate::gossip::engine::GossipEngine;
use crate::gossip::error::*;
use crate::gossip::keys;
use crate::gossip::manager::{Identity, Manager};
use crate::gossip::{discovery, transport};

/// A running mesh node. Cloning is not needed: every method takes
/// `&self` and the handle is cheap to share behind an `Arc` if an
/// embedder needs to.
pub struct Node {
    manager: Arc<Manager>,
    engine: Arc<GossipEngine>,
    delivery_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Node {
    /// Starts the directory, connection manager, gossip engine,
    /// discovery loop and HTTP/WS server described by `cfg`, and
    /// returns a handle to interact with the running mesh.
    pub async fn initialize(cfg: Config) -> Result<Self> {
        let network_dir = cfg.network_dir().wrapped(ErrorKind::Config)?;

        let signing_key = Arc::new(keys::load_or_generate(&network_dir)?);
        let seal_keypair = Arc::new(SealKeyPair::generate());
        let identity = Arc::new(Identity::new(signing_key, seal_keypair.public_key()));

        let directory = Arc::new(Directory::open(&network_dir.join("p2p.sqlite"))?);
        let seeds: Vec<Peer> = cfg.seeds.iter().cloned().map(Peer::from).collect();
        directory.import_seeds(&seeds)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Manager::new(identity, cfg.network_id, cfg.port, directory.clone(), events_tx));
        manager.spawn_loops();

        discovery::spawn(directory);

        let (engine, delivery_rx) = GossipEngine::new(manager.clone(), seal_keypair);
        tokio::spawn(engine.clone().run(events_rx));

        serve(manager.clone(), cfg.port).await?;

        Ok(Node { manager, engine, delivery_rx: Mutex::new(delivery_rx) })
    }

    /// Gossips `payload` to the mesh, returning the message id assigned
    /// to it. Delivers to this node's own queue first, independent of
    /// how many peers are currently connected.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Uuid {
        self.engine.broadcast(payload).await
    }

    /// Best-effort direct delivery to exactly one peer identified by
    /// the hex encoding of its long-term public signing key. Returns
    /// whether an authorized link to that peer currently exists.
    pub fn whisper(&self, payload: &[u8], target_sign_key_hex: &str) -> bool {
        self.engine.whisper(payload, target_sign_key_hex)
    }

    /// Blocks until a fresh gossip payload (broadcast or whisper)
    /// arrives, or returns `None` once the node has shut down.
    pub async fn read_message(&self) -> Option<Vec<u8>> {
        self.delivery_rx.lock().await.recv().await
    }

    /// Currently authorized peers, deduplicated across inbound and
    /// outbound links.
    pub fn get_peer_list(&self) -> Vec<Peer> {
        self.manager.authorized_peer_list()
    }
}

async fn serve(manager: Arc<Manager>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let router = transport::router(manager).into_make_service_with_connect_info::<SocketAddr>();
    let server = axum::Server::try_bind(&addr)
        .wrapped(ErrorKind::Config)?
        .serve(router);
    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server exited");
        }
    });
    Ok(())
}
