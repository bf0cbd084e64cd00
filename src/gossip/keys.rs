//! Long-term signing key persistence, matching the original
//! implementation's `keys.go`: a hex-encoded keypair stored as two
//! sibling files under the network's data directory, generated once on
//! first run.

use std::path::Path;

use crate::gossip::crypto::signature::KeyPair;
use crate::gossip::error::*;

const PRIVATE_KEY_FILE: &str = "signKey.priv";
const PUBLIC_KEY_FILE: &str = "signKey.pub";

/// Loads the signing keypair from `dir`, generating and persisting a
/// fresh one if absent.
pub fn load_or_generate(dir: &Path) -> Result<KeyPair> {
    let priv_path = dir.join(PRIVATE_KEY_FILE);
    if priv_path.exists() {
        let hex_bytes = std::fs::read_to_string(&priv_path).wrapped(ErrorKind::KeyStorage)?;
        let secret = hex::decode(hex_bytes.trim()).simple(ErrorKind::KeyStorage)?;
        return KeyPair::from_bytes(&secret);
    }

    let keypair = KeyPair::generate();
    write_private(&priv_path, &keypair)?;
    write_public(&dir.join(PUBLIC_KEY_FILE), &keypair)?;
    Ok(keypair)
}

fn write_private(path: &Path, keypair: &KeyPair) -> Result<()> {
    let contents = hex::encode(keypair.secret_bytes());
    write_with_restricted_perms(path, &contents)
}

fn write_public(path: &Path, keypair: &KeyPair) -> Result<()> {
    let contents = hex::encode(keypair.public_key().as_bytes());
    write_with_restricted_perms(path, &contents)
}

#[cfg(unix)]
fn write_with_restricted_perms(path: &Path, contents: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .wrapped(ErrorKind::KeyStorage)?;
    file.write_all(contents.as_bytes()).wrapped(ErrorKind::KeyStorage)
}

#[cfg(not(unix))]
fn write_with_restricted_perms(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).wrapped(ErrorKind::KeyStorage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_then_reloads_the_same_identity() {
        let dir = tempfile_dir();
        let first = load_or_generate(&dir).unwrap();
        let second = load_or_generate(&dir).unwrap();
        assert_eq!(first.public_key().as_bytes(), second.public_key().as_bytes());
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempfile_dir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("gossipmesh-keys-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
