//! Connection manager (C6): dials peers, enforces the outbound
//! connection cap, prunes dead links, and keeps the peer directory in
//! sync with what authenticated. Owns the inbound and outbound link
//! registries exclusively — sessions never reach back into this
//! module; they only push [`SessionEvent`]s onto a channel this
//! module's owner (the gossip engine) drains.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;

use crate::gossip::crypto::seal::SealPublicKey;
use crate::gossip::crypto::signature::{KeyPair as SigningKeyPair, PublicKey as SignPublicKey};
use crate::gossip::directory::{Directory, Peer};
use crate::gossip::session::{self, LinkHandle, NodeContext, SessionEvent, State};
use crate::gossip::transport;

/// Maximum number of authorized outbound links.
pub const MAX_OUTBOUND: usize = 8;

const DIAL_PERIOD: Duration = Duration::from_secs(1);
const PRUNE_PERIOD: Duration = Duration::from_secs(1);

/// This node's long-term identity, shared by the transport layer (to
/// answer `/info`) and every spawned session (to answer challenges).
pub struct Identity {
    signing_key: Arc<SigningKeyPair>,
    seal_public: SealPublicKey,
}

impl Identity {
    pub fn new(signing_key: Arc<SigningKeyPair>, seal_public: SealPublicKey) -> Self {
        Identity { signing_key, seal_public }
    }

    pub fn sign_public(&self) -> SignPublicKey {
        self.signing_key.public_key()
    }

    pub fn seal_public(&self) -> SealPublicKey {
        self.seal_public.clone()
    }
}

pub struct Manager {
    identity: Arc<Identity>,
    network_id: uuid::Uuid,
    listen_port: u16,
    directory: Arc<Directory>,
    http: reqwest::Client,
    outbound: RwLock<HashMap<u64, Arc<LinkHandle>>>,
    inbound: RwLock<HashMap<u64, Arc<LinkHandle>>>,
    next_id: AtomicU64,
    events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
}

impl Manager {
    pub fn new(
        identity: Arc<Identity>,
        network_id: uuid::Uuid,
        listen_port: u16,
        directory: Arc<Directory>,
        events: tokio::sync::mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Manager {
            identity,
            network_id,
            listen_port,
            directory,
            http: reqwest::Client::new(),
            outbound: RwLock::new(HashMap::new()),
            inbound: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    fn context(&self) -> NodeContext {
        NodeContext {
            network_id: self.network_id,
            signing_key: self.identity.signing_key.clone(),
            seal_public_key: self.identity.seal_public.clone(),
            listen_port: self.listen_port,
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a freshly accepted inbound transport and begins the
    /// challenge/response handshake on it.
    pub fn accept_inbound<T>(self: &Arc<Self>, io: T, remote_host: String) -> Arc<LinkHandle>
    where
        T: session::LinkIo + 'static,
    {
        let id = self.allocate_id();
        let handle = session::spawn_accepting(id, io, remote_host, self.context(), self.events.clone());
        self.inbound.write().insert(id, handle.clone());
        handle
    }

    /// Returns the union of authorized outbound and inbound links,
    /// deduplicated by signing key, matching `GetPeerList`.
    pub fn authorized_peer_list(&self) -> Vec<Peer> {
        let mut by_sign_key = HashMap::new();
        for handle in self.outbound.read().values().chain(self.inbound.read().values()) {
            if !handle.is_authorized() {
                continue;
            }
            let Some(sign_key) = handle.remote_sign_key() else { continue };
            let sign_key_hex = hex::encode(sign_key.as_bytes());
            by_sign_key.entry(sign_key_hex.clone()).or_insert_with(|| Peer {
                host: handle.remote_host.clone(),
                port: handle.remote_port(),
                sign_key: sign_key_hex,
                last_seen: Utc::now(),
                accessible: true,
                fail_count: 0,
            });
        }
        by_sign_key.into_values().collect()
    }

    /// Looks up an authorized link by the hex-encoded signing key of
    /// its remote peer, outbound set first then inbound, per the
    /// whisper routing rule.
    pub fn find_authorized_by_sign_key(&self, sign_key_hex: &str) -> Option<Arc<LinkHandle>> {
        let matches = |h: &&Arc<LinkHandle>| {
            h.is_authorized()
                && h.remote_sign_key()
                    .map(|k| hex::encode(k.as_bytes()) == sign_key_hex)
                    .unwrap_or(false)
        };
        if let Some(handle) = self.outbound.read().values().find(matches) {
            return Some(handle.clone());
        }
        self.inbound.read().values().find(matches).cloned()
    }

    /// Looks up any link (authorized or not) by its id, regardless of
    /// direction. Used by the gossip engine to recover a link's remote
    /// sealing key when an event arrives bearing only its id.
    pub fn link_by_id(&self, id: u64) -> Option<Arc<LinkHandle>> {
        if let Some(handle) = self.outbound.read().get(&id) {
            return Some(handle.clone());
        }
        self.inbound.read().get(&id).cloned()
    }

    /// Every currently authorized link, for gossip fan-out.
    pub fn authorized_links(&self) -> Vec<Arc<LinkHandle>> {
        self.outbound
            .read()
            .values()
            .chain(self.inbound.read().values())
            .filter(|h| h.is_authorized())
            .cloned()
            .collect()
    }

    fn authorized_outbound_count(&self) -> usize {
        self.outbound.read().values().filter(|h| h.is_authorized()).count()
    }

    /// Called by the gossip engine's event loop when a link finishes the
    /// handshake. Both directions upsert the directory on success: an
    /// inbound link from a non-loopback address is a newly discovered
    /// peer worth persisting; an outbound link confirms and refreshes an
    /// entry that already came from the directory.
    pub async fn on_authorized(self: &Arc<Self>, id: u64, remote_sign_key: SignPublicKey, remote_port: u16) {
        if let Some(handle) = self.outbound.read().get(&id).cloned() {
            let peer = Peer {
                host: handle.remote_host.clone(),
                port: handle.remote_port(),
                sign_key: hex::encode(remote_sign_key.as_bytes()),
                last_seen: Utc::now(),
                accessible: true,
                fail_count: 0,
            };
            if let Err(e) = self.directory.upsert(&peer) {
                tracing::warn!(error = %e, "failed to refresh outbound peer in directory");
            }
            return;
        }

        let Some(handle) = self.inbound.read().get(&id).cloned() else {
            return;
        };
        if IpAddr::from_str(&handle.remote_host).map(|ip| ip.is_loopback()).unwrap_or(false) {
            return;
        }
        let accessible = transport::probe_info(&self.http, &handle.remote_host, remote_port)
            .await
            .is_ok();
        let peer = Peer {
            host: handle.remote_host.clone(),
            port: remote_port,
            sign_key: hex::encode(remote_sign_key.as_bytes()),
            last_seen: Utc::now(),
            accessible,
            fail_count: 0,
        };
        if let Err(e) = self.directory.upsert(&peer) {
            tracing::warn!(error = %e, "failed to upsert inbound peer into directory");
        }
    }

    /// Spawns the manager's background loops onto the current runtime.
    /// Returns immediately; the loops run until the process exits.
    pub fn spawn_loops(self: &Arc<Self>) {
        let dial_mgr = self.clone();
        tokio::spawn(async move { dial_mgr.dial_loop().await });

        let prune_mgr = self.clone();
        tokio::spawn(async move { prune_mgr.prune_loop().await });
    }

    async fn dial_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(DIAL_PERIOD).await;
            if self.authorized_outbound_count() >= MAX_OUTBOUND {
                continue;
            }
            let Ok(Some(peer)) = self.directory.random_accessible() else { continue };
            if self.is_dialing(&peer.sign_key) {
                continue;
            }
            let info = match transport::probe_info(&self.http, &peer.host, peer.port).await {
                Ok(info) => info,
                Err(_) => continue,
            };
            // The dialing side never learns the peer's identity from the
            // wire handshake (only the `response` frame carries a public
            // key, and we're the one sending it) — `/info` is the only
            // source for it.
            let Some(remote_sign_key) = hex::decode(&info.pub_sign_key)
                .ok()
                .and_then(|b| SignPublicKey::from_bytes(&b).ok())
            else {
                continue;
            };
            let Some(remote_seal_key) = hex::decode(&info.pub_seal_key)
                .ok()
                .and_then(|b| SealPublicKey::from_bytes(&b).ok())
            else {
                continue;
            };

            let mut seen = peer.clone();
            seen.last_seen = Utc::now();
            let _ = self.directory.upsert(&seen);

            let io = match transport::dial(&peer.host, peer.port).await {
                Ok(io) => io,
                Err(_) => {
                    let _ = self.directory.mark_failed(&peer.sign_key);
                    continue;
                }
            };
            let id = self.allocate_id();
            let handle = session::spawn_dialing(
                id,
                io,
                peer.host.clone(),
                peer.port,
                remote_sign_key,
                remote_seal_key,
                self.context(),
                self.events.clone(),
            );
            self.outbound.write().insert(id, handle);
        }
    }

    fn is_dialing(&self, sign_key_hex: &str) -> bool {
        self.outbound
            .read()
            .values()
            .any(|h| h.remote_sign_key().map(|k| hex::encode(k.as_bytes()) == sign_key_hex).unwrap_or(false))
    }

    async fn prune_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(PRUNE_PERIOD).await;
            self.prune_set(&self.outbound);
            self.prune_set(&self.inbound);
        }
    }

    fn prune_set(&self, set: &RwLock<HashMap<u64, Arc<LinkHandle>>>) {
        let dead: Vec<(u64, Option<SignPublicKey>)> = set
            .read()
            .iter()
            .filter(|(_, h)| h.state() == State::Failed || h.state() == State::Closed)
            .map(|(id, h)| (*id, h.remote_sign_key()))
            .collect();
        if dead.is_empty() {
            return;
        }
        let mut guard = set.write();
        for (id, sign_key) in dead {
            guard.remove(&id);
            if let Some(key) = sign_key {
                let _ = self.directory.mark_failed(&hex::encode(key.as_bytes()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::crypto::seal::SealKeyPair;
    use crate::gossip::directory::Directory;
    use crate::gossip::error::*;
    use crate::gossip::session::LinkIo;
    use tokio::sync::mpsc as tmpsc;

    struct ChannelIo {
        tx: tmpsc::UnboundedSender<Vec<u8>>,
        rx: tmpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl LinkIo for ChannelIo {
        async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
            self.tx.send(bytes).simple(ErrorKind::Transport)
        }

        async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.rx.recv().await)
        }
    }

    fn channel_pair() -> (ChannelIo, ChannelIo) {
        let (a_tx, b_rx) = tmpsc::unbounded_channel();
        let (b_tx, a_rx) = tmpsc::unbounded_channel();
        (ChannelIo { tx: a_tx, rx: a_rx }, ChannelIo { tx: b_tx, rx: b_rx })
    }

    fn test_manager() -> (Arc<Manager>, uuid::Uuid, tmpsc::UnboundedReceiver<SessionEvent>) {
        let signing_key = Arc::new(SigningKeyPair::generate());
        let seal_keypair = SealKeyPair::generate();
        let identity = Arc::new(Identity::new(signing_key, seal_keypair.public_key()));
        let directory = Arc::new(Directory::open_in_memory().unwrap());
        let network_id = uuid::Uuid::new_v4();
        let (events_tx, events_rx) = tmpsc::unbounded_channel();
        let manager = Arc::new(Manager::new(identity, network_id, 9001, directory, events_tx));
        (manager, network_id, events_rx)
    }

    #[tokio::test]
    async fn accepted_link_becomes_visible_once_authorized() {
        let (manager, network_id, _events_rx) = test_manager();
        let (accepting_io, dialing_io) = channel_pair();

        let handle = manager.accept_inbound(accepting_io, "10.0.0.2".to_string());
        assert_eq!(handle.direction, session::Direction::Inbound);
        assert!(manager.authorized_peer_list().is_empty());

        let dialing_signing_key = Arc::new(SigningKeyPair::generate());
        let dialing_seal_keypair = SealKeyPair::generate();
        let dialing_sign_public = dialing_signing_key.public_key();
        let dialing_ctx = NodeContext {
            network_id,
            signing_key: dialing_signing_key,
            seal_public_key: dialing_seal_keypair.public_key(),
            listen_port: 9002,
        };
        let (dialing_events_tx, _dialing_events_rx) = tmpsc::unbounded_channel();
        let _dialing = session::spawn_dialing(
            100,
            dialing_io,
            "127.0.0.1".to_string(),
            9001,
            manager.identity().sign_public(),
            manager.identity().seal_public(),
            dialing_ctx,
            dialing_events_tx,
        );

        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_authorized() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("inbound link should authorize");

        let sign_key_hex = hex::encode(dialing_sign_public.as_bytes());
        assert!(manager.find_authorized_by_sign_key(&sign_key_hex).is_some());
        assert!(manager.link_by_id(handle.id).is_some());
        assert!(manager.link_by_id(9999).is_none());

        let peers = manager.authorized_peer_list();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].sign_key, sign_key_hex);
    }

    #[tokio::test]
    async fn unauthorized_link_is_invisible_to_lookups() {
        let (manager, _network_id, _events_rx) = test_manager();
        let (accepting_io, _keep_peer_end_alive) = channel_pair();

        let handle = manager.accept_inbound(accepting_io, "10.0.0.2".to_string());
        assert!(!handle.is_authorized());
        assert!(manager.authorized_links().is_empty());
        assert!(manager.authorized_peer_list().is_empty());
    }
}
