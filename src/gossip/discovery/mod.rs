//! Discovery loop (C7): periodically queries known peers for their
//! peer lists and merges newly-seen ones into the directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::gossip::directory::{Directory, Peer};
use crate::gossip::transport;

const DISCOVERY_PERIOD: Duration = Duration::from_secs(180);

/// Spawns the discovery loop onto the current runtime. Runs until the
/// process exits; failures are per-peer and never escalate.
pub fn spawn(directory: Arc<Directory>) {
    tokio::spawn(run(directory));
}

async fn run(directory: Arc<Directory>) {
    let client = reqwest::Client::new();
    loop {
        tokio::time::sleep(DISCOVERY_PERIOD).await;
        run_once(&client, &directory).await;
    }
}

async fn run_once(client: &reqwest::Client, directory: &Directory) {
    let Ok(known) = directory.list() else { return };
    for peer in &known {
        let Ok(advertised) = transport::probe_peers(client, &peer.host, peer.port).await else {
            continue;
        };
        for candidate in advertised {
            match directory.find_by_sign_key(&candidate.sign_key) {
                Ok(Some(_)) => continue,
                Err(_) => continue,
                Ok(None) => {}
            }
            // Trust the signing key the candidate itself reports over
            // `/info`, not the one the intermediary advertised for it.
            let Ok(info) = transport::probe_info(client, &candidate.host, candidate.port).await else {
                continue;
            };
            let discovered = Peer {
                host: candidate.host,
                port: candidate.port,
                sign_key: info.pub_sign_key,
                last_seen: Utc::now(),
                accessible: true,
                fail_count: 0,
            };
            if let Err(e) = directory.upsert(&discovered) {
                tracing::warn!(error = %e, "failed to persist discovered peer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_is_a_no_op_with_an_empty_directory() {
        let directory = Directory::open_in_memory().unwrap();
        let client = reqwest::Client::new();
        run_once(&client, &directory).await;
        assert!(directory.list().unwrap().is_empty());
    }
}
