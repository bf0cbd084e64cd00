pub mod gossip;

pub use gossip::config::{Config, SeedPeer};
pub use gossip::directory::Peer;
pub use gossip::error::{Error, ErrorKind, Result};
pub use gossip::node::Node;
