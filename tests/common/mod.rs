//! Shared helpers for the end-to-end gossip scenario tests: each test
//! spins up real nodes bound to loopback ports and waits for them to
//! authorize before exercising broadcast/whisper.

use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use gossipmesh::{Config, Node, Peer, SeedPeer};
use uuid::Uuid;

/// The dialing side never trusts a seed's `sign_key` for the handshake
/// itself — it always re-learns the real key from the peer's `/info`
/// response before dialing — so any placeholder value bootstraps a
/// fresh directory entry just as well as the real key would.
const PLACEHOLDER_SIGN_KEY: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Reserves an OS-assigned loopback port by binding and immediately
/// releasing it.
pub fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("binding an ephemeral port should not fail")
        .local_addr()
        .unwrap()
        .port()
}

fn scratch_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("gossipmesh-test-{}-{}", label, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Starts a node on `port`, optionally seeded with a peer already
/// listening on `seed_port`.
pub async fn spin_up(label: &str, network_id: Uuid, port: u16, seed_port: Option<u16>) -> Node {
    let seeds = seed_port
        .map(|seed_port| {
            vec![SeedPeer {
                host: "127.0.0.1".to_string(),
                port: seed_port,
                sign_key: PLACEHOLDER_SIGN_KEY.to_string(),
            }]
        })
        .unwrap_or_default();
    let cfg = Config {
        port,
        network_id,
        log_level: tracing::level_filters::LevelFilter::OFF,
        seeds,
        data_dir: Some(scratch_dir(label)),
    };
    Node::initialize(cfg).await.expect("node should initialize")
}

/// Polls `f` every 20ms until it returns `Some`, panicking if `deadline`
/// elapses first.
pub async fn wait_until<F, T>(deadline: Duration, mut f: F) -> T
where
    F: FnMut() -> Option<T>,
{
    let start = tokio::time::Instant::now();
    loop {
        if let Some(value) = f() {
            return value;
        }
        if start.elapsed() > deadline {
            panic!("condition was not met within {:?}", deadline);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Finds the peer list entry advertising `port`, if any.
pub fn peer_on_port(peers: &[Peer], port: u16) -> Option<Peer> {
    peers.iter().find(|p| p.port == port).cloned()
}
