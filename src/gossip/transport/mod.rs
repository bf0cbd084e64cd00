//! HTTP/WebSocket transport: the accepting-side server (`/`, `/info`,
//! `/peers`, `/socket`) built on `axum`, and the dialing-side client
//! probes (`GET /info`, `GET /peers`) built on `reqwest` plus a
//! `tokio-tungstenite` WebSocket dial. Both the server's split
//! WebSocket and the client's split WebSocket implement
//! [`crate::gossip::session::LinkIo`], so the session state machine
//! never has to know which one it is driving.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::gossip::directory::Peer;
use crate::gossip::error::*;
use crate::gossip::manager::Manager;
use crate::gossip::session::LinkIo;

/// Binary frames only; 3 MiB is the original implementation's read
/// limit on the socket.
const MAX_FRAME_BYTES: usize = 3 * 1024 * 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// `GET /info` response shape.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InfoResponse {
    #[serde(rename = "pubSignKey")]
    pub pub_sign_key: String,
    #[serde(rename = "pubSealKey")]
    pub pub_seal_key: String,
    pub version: String,
}

/// One entry of the `GET /peers` response.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerEntry {
    pub host: String,
    pub port: u16,
    #[serde(rename = "signKey")]
    pub sign_key: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub accessible: bool,
}

impl From<Peer> for PeerEntry {
    fn from(peer: Peer) -> Self {
        PeerEntry {
            host: peer.host,
            port: peer.port,
            sign_key: peer.sign_key,
            last_seen: peer.last_seen,
            accessible: peer.accessible,
        }
    }
}

/// Builds the router served by this node. `manager` is shared with the
/// background dial/prune/discovery tasks.
pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/info", get(info))
        .route("/peers", get(peers))
        .route("/socket", get(socket))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(manager)
}

async fn home() -> impl IntoResponse {
    Html("<html><body><h1>gossipmesh node</h1></body></html>")
}

async fn info(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    Json(InfoResponse {
        pub_sign_key: hex::encode(manager.identity().sign_public().as_bytes()),
        pub_seal_key: hex::encode(manager.identity().seal_public().as_bytes()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn peers(State(manager): State<Arc<Manager>>) -> impl IntoResponse {
    let entries: Vec<PeerEntry> = manager
        .authorized_peer_list()
        .into_iter()
        .map(PeerEntry::from)
        .collect();
    Json(entries)
}

async fn socket(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(manager): State<Arc<Manager>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            manager.accept_inbound(AxumLinkIo::new(socket), addr.ip().to_string());
        })
}

/// Wraps an accepted axum WebSocket as a [`LinkIo`].
pub struct AxumLinkIo {
    socket: WebSocket,
}

impl AxumLinkIo {
    fn new(socket: WebSocket) -> Self {
        AxumLinkIo { socket }
    }
}

#[async_trait]
impl LinkIo for AxumLinkIo {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.socket
            .send(AxumMessage::Binary(bytes))
            .await
            .simple(ErrorKind::Transport)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            return match self.socket.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(e).simple(ErrorKind::Transport),
                Some(Ok(AxumMessage::Binary(bytes))) => Ok(Some(bytes)),
                Some(Ok(AxumMessage::Close(_))) => Ok(None),
                // Text/ping/pong frames are not part of the protocol;
                // axum answers WS-level pings itself, so we just loop.
                Some(Ok(_)) => continue,
            };
        }
    }
}

/// Wraps a dialed `tokio-tungstenite` WebSocket as a [`LinkIo`].
pub struct TungsteniteLinkIo {
    socket: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl LinkIo for TungsteniteLinkIo {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.socket
            .send(TungsteniteMessage::Binary(bytes))
            .await
            .simple(ErrorKind::Transport)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            return match self.socket.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(e).simple(ErrorKind::Transport),
                Some(Ok(TungsteniteMessage::Binary(bytes))) => Ok(Some(bytes)),
                Some(Ok(TungsteniteMessage::Close(_))) => Ok(None),
                Some(Ok(_)) => continue,
            };
        }
    }
}

/// Dials `host:port`'s `/socket` endpoint.
pub async fn dial(host: &str, port: u16) -> Result<TungsteniteLinkIo> {
    let url = format!("ws://{host}:{port}/socket");
    let (socket, _response) = tokio_tungstenite::connect_async(url)
        .await
        .simple(ErrorKind::Transport)?;
    Ok(TungsteniteLinkIo { socket })
}

/// Probes `host:port`'s `GET /info`, with a 1 s deadline.
pub async fn probe_info(client: &reqwest::Client, host: &str, port: u16) -> Result<InfoResponse> {
    let url = format!("http://{host}:{port}/info");
    client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .simple(ErrorKind::Discovery)?
        .json::<InfoResponse>()
        .await
        .simple(ErrorKind::Discovery)
}

/// Probes `host:port`'s `GET /peers`, with a 1 s deadline.
pub async fn probe_peers(client: &reqwest::Client, host: &str, port: u16) -> Result<Vec<PeerEntry>> {
    let url = format!("http://{host}:{port}/peers");
    client
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .simple(ErrorKind::Discovery)?
        .json::<Vec<PeerEntry>>()
        .await
        .simple(ErrorKind::Discovery)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_response_uses_the_wire_field_names() {
        let json = serde_json::json!({
            "pubSignKey": "aa",
            "pubSealKey": "bb",
            "version": "0.1.0",
        });
        let info: InfoResponse = serde_json::from_value(json).unwrap();
        assert_eq!(info.pub_sign_key, "aa");
        assert_eq!(info.pub_seal_key, "bb");
    }

    #[test]
    fn peer_entry_round_trips_from_a_directory_peer() {
        let peer = Peer {
            host: "10.0.0.5".into(),
            port: 9001,
            sign_key: "deadbeef".into(),
            last_seen: chrono::Utc::now(),
            accessible: true,
            fail_count: 3,
        };
        let entry = PeerEntry::from(peer.clone());
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["signKey"], "deadbeef");
        assert_eq!(value["lastSeen"].is_string(), true);
        assert!(!value.as_object().unwrap().contains_key("fail_count"));
    }
}
