//! The `Config` struct consumed by [`crate::gossip::node::Node::initialize`]
//! (C11), plus seed import. Loading configuration from a file or CLI
//! flags is the embedder's job — this crate only defines the shape.

use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use uuid::Uuid;

use crate::gossip::directory::Peer;

/// A peer known before startup, used to bootstrap the directory on a
/// fresh deployment.
#[derive(Debug, Clone)]
pub struct SeedPeer {
    pub host: String,
    pub port: u16,
    /// Hex-encoded Ed25519 public signing key.
    pub sign_key: String,
}

impl From<SeedPeer> for Peer {
    fn from(seed: SeedPeer) -> Self {
        Peer {
            host: seed.host,
            port: seed.port,
            sign_key: seed.sign_key,
            last_seen: chrono::Utc::now(),
            accessible: true,
            fail_count: 0,
        }
    }
}

/// Configuration accepted by `Node::initialize`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port this node listens on for `/socket`, `/info`, `/peers`, `/`.
    pub port: u16,
    /// Shared deployment identifier; peers with a mismatched id refuse
    /// each other during the handshake.
    pub network_id: Uuid,
    /// Minimum severity this node's `tracing` events are emitted at.
    /// Installing a subscriber that honors it is the embedder's job.
    pub log_level: LevelFilter,
    /// Peers used to bootstrap a fresh directory. Ignored for ids
    /// already on disk.
    pub seeds: Vec<SeedPeer>,
    /// Root directory for this node's persisted state
    /// (`<data_dir>/<network_id>/{p2p.sqlite,signKey.{pub,priv}}`).
    /// Defaults to `dirs::home_dir()/.gossipmesh` when absent.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// The directory holding this network id's persisted state,
    /// creating it (and its parents) with `0700` permissions if this
    /// is the first run.
    pub fn network_dir(&self) -> std::io::Result<PathBuf> {
        let root = self.data_dir.clone().unwrap_or_else(default_data_dir);
        let dir = root.join(self.network_id.to_string());
        create_private_dir(&dir)?;
        Ok(dir)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".gossipmesh")
}

#[cfg(unix)]
fn create_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    if dir.exists() {
        return Ok(());
    }
    DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_dir_is_created_and_idempotent() {
        let data_dir = std::env::temp_dir().join(format!("gossipmesh-config-test-{}", std::process::id()));
        let cfg = Config {
            port: 9001,
            network_id: Uuid::new_v4(),
            log_level: LevelFilter::INFO,
            seeds: Vec::new(),
            data_dir: Some(data_dir.clone()),
        };

        let first = cfg.network_dir().unwrap();
        assert!(first.is_dir());
        let second = cfg.network_dir().unwrap();
        assert_eq!(first, second, "calling network_dir twice must not fail or move the directory");

        std::fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn seed_peer_converts_into_an_accessible_directory_peer() {
        let seed = SeedPeer {
            host: "10.0.0.9".into(),
            port: 9100,
            sign_key: "abcd".into(),
        };
        let peer: Peer = seed.into();
        assert_eq!(peer.host, "10.0.0.9");
        assert_eq!(peer.port, 9100);
        assert!(peer.accessible);
        assert_eq!(peer.fail_count, 0);
    }
}
