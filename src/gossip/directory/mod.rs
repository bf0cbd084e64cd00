//! Persistent table of known peers, keyed by signing key. Backed by a
//! single-file SQLite database, one per network id, migrated
//! automatically on open — matching the original implementation's
//! `gorm`-backed `AutoMigrate(&Peer{})`, transliterated to
//! `rusqlite`'s idiomatic `CREATE TABLE IF NOT EXISTS`.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::gossip::error::*;

/// Maximum number of dial/auth failures tolerated before a peer is
/// evicted from the directory.
pub const MAX_FAIL_COUNT: i64 = 5;

/// A single known peer, as persisted in the directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub host: String,
    pub port: u16,
    #[serde(rename = "signKey")]
    pub sign_key: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
    pub accessible: bool,
    #[serde(skip)]
    pub fail_count: i64,
}

/// Thread-safe handle to the peer directory's SQLite connection.
///
/// Locks are held only for the duration of a single query; they are
/// never held across network I/O.
pub struct Directory {
    conn: Mutex<Connection>,
}

impl Directory {
    /// Opens (creating if absent) the directory database at `path`
    /// and runs its migration.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).wrapped(ErrorKind::Directory)?;
        let dir = Directory { conn: Mutex::new(conn) };
        dir.migrate()?;
        Ok(dir)
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().wrapped(ErrorKind::Directory)?;
        let dir = Directory { conn: Mutex::new(conn) };
        dir.migrate()?;
        Ok(dir)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS peers (
                id          INTEGER PRIMARY KEY,
                host        TEXT NOT NULL,
                port        INTEGER NOT NULL,
                sign_key    TEXT NOT NULL UNIQUE,
                last_seen   INTEGER NOT NULL,
                accessible  INTEGER NOT NULL DEFAULT 0,
                fail_count  INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .wrapped(ErrorKind::Directory)
    }

    /// Imports seed peers at startup: inserts each one absent by
    /// `sign_key`, leaves existing entries untouched.
    pub fn import_seeds(&self, seeds: &[Peer]) -> Result<()> {
        for seed in seeds {
            if self.find_by_sign_key(&seed.sign_key)?.is_none() {
                self.upsert(seed)?;
            }
        }
        Ok(())
    }

    /// Returns every known peer.
    pub fn list(&self) -> Result<Vec<Peer>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT host, port, sign_key, last_seen, accessible, fail_count FROM peers")
            .wrapped(ErrorKind::Directory)?;
        let rows = stmt
            .query_map([], Self::row_to_peer)
            .wrapped(ErrorKind::Directory)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .wrapped(ErrorKind::Directory)
    }

    /// Inserts `peer` if absent, otherwise overwrites its host, port,
    /// `last_seen` and `accessible` fields — `sign_key` uniquely
    /// identifies a peer, so host/port churn never creates a
    /// duplicate row.
    pub fn upsert(&self, peer: &Peer) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO peers (host, port, sign_key, last_seen, accessible, fail_count)
            VALUES (?1, ?2, ?3, ?4, ?5, 0)
            ON CONFLICT(sign_key) DO UPDATE SET
                host = excluded.host,
                port = excluded.port,
                last_seen = excluded.last_seen,
                accessible = excluded.accessible
            "#,
            params![
                peer.host,
                peer.port,
                peer.sign_key,
                peer.last_seen.timestamp(),
                peer.accessible as i64,
            ],
        )
        .wrapped(ErrorKind::Directory)?;
        Ok(())
    }

    /// Marks a dial/auth failure against `sign_key`. If the peer's
    /// `fail_count` is already over [`MAX_FAIL_COUNT`], it is deleted
    /// outright; otherwise the counter is incremented.
    pub fn mark_failed(&self, sign_key: &str) -> Result<()> {
        let conn = self.conn.lock();
        let fail_count: Option<i64> = conn
            .query_row(
                "SELECT fail_count FROM peers WHERE sign_key = ?1",
                params![sign_key],
                |row| row.get(0),
            )
            .optional()
            .wrapped(ErrorKind::Directory)?;

        let Some(fail_count) = fail_count else {
            return Ok(());
        };

        if fail_count > MAX_FAIL_COUNT {
            conn.execute("DELETE FROM peers WHERE sign_key = ?1", params![sign_key])
                .wrapped(ErrorKind::Directory)?;
        } else {
            conn.execute(
                "UPDATE peers SET fail_count = fail_count + 1 WHERE sign_key = ?1",
                params![sign_key],
            )
            .wrapped(ErrorKind::Directory)?;
        }
        Ok(())
    }

    /// Returns one uniformly random peer with `accessible = true`, if
    /// any exist.
    pub fn random_accessible(&self) -> Result<Option<Peer>> {
        let candidates = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT host, port, sign_key, last_seen, accessible, fail_count \
                     FROM peers WHERE accessible = 1",
                )
                .wrapped(ErrorKind::Directory)?;
            let rows = stmt
                .query_map([], Self::row_to_peer)
                .wrapped(ErrorKind::Directory)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .wrapped(ErrorKind::Directory)?
        };
        Ok(candidates.choose(&mut rand::thread_rng()).cloned())
    }

    pub fn find_by_sign_key(&self, sign_key: &str) -> Result<Option<Peer>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT host, port, sign_key, last_seen, accessible, fail_count \
             FROM peers WHERE sign_key = ?1",
            params![sign_key],
            Self::row_to_peer,
        )
        .optional()
        .wrapped(ErrorKind::Directory)
    }

    fn row_to_peer(row: &rusqlite::Row) -> rusqlite::Result<Peer> {
        let last_seen: i64 = row.get(3)?;
        Ok(Peer {
            host: row.get(0)?,
            port: row.get(1)?,
            sign_key: row.get(2)?,
            last_seen: DateTime::from_timestamp(last_seen, 0).unwrap_or_else(Utc::now),
            accessible: row.get::<_, i64>(4)? != 0,
            fail_count: row.get(5)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(sign_key: &str) -> Peer {
        Peer {
            host: "127.0.0.1".into(),
            port: 9000,
            sign_key: sign_key.into(),
            last_seen: Utc::now(),
            accessible: true,
            fail_count: 0,
        }
    }

    #[test]
    fn upsert_then_find() {
        let dir = Directory::open_in_memory().unwrap();
        dir.upsert(&peer("abc")).unwrap();
        let found = dir.find_by_sign_key("abc").unwrap().unwrap();
        assert_eq!(found.sign_key, "abc");
        assert!(found.accessible);
    }

    #[test]
    fn upsert_overwrites_host_port_not_identity() {
        let dir = Directory::open_in_memory().unwrap();
        dir.upsert(&peer("abc")).unwrap();

        let mut moved = peer("abc");
        moved.host = "10.0.0.5".into();
        moved.port = 9001;
        dir.upsert(&moved).unwrap();

        let all = dir.list().unwrap();
        assert_eq!(all.len(), 1, "sign_key uniquely identifies a peer");
        assert_eq!(all[0].host, "10.0.0.5");
        assert_eq!(all[0].port, 9001);
    }

    #[test]
    fn mark_failed_increments_then_evicts() {
        let dir = Directory::open_in_memory().unwrap();
        dir.upsert(&peer("abc")).unwrap();

        // Each call increments fail_count while it is <= MAX_FAIL_COUNT;
        // the call that observes fail_count > MAX_FAIL_COUNT deletes
        // instead, so it takes MAX_FAIL_COUNT + 2 calls to evict.
        for _ in 0..MAX_FAIL_COUNT + 2 {
            dir.mark_failed("abc").unwrap();
        }
        assert!(dir.find_by_sign_key("abc").unwrap().is_none());
    }

    #[test]
    fn seed_import_does_not_clobber_existing() {
        let dir = Directory::open_in_memory().unwrap();
        let mut p = peer("abc");
        p.host = "1.2.3.4".into();
        dir.upsert(&p).unwrap();

        let mut seed = peer("abc");
        seed.host = "9.9.9.9".into();
        dir.import_seeds(&[seed]).unwrap();

        let found = dir.find_by_sign_key("abc").unwrap().unwrap();
        assert_eq!(found.host, "1.2.3.4");
    }

    #[test]
    fn random_accessible_only_returns_accessible_peers() {
        let dir = Directory::open_in_memory().unwrap();
        let mut inaccessible = peer("dead");
        inaccessible.accessible = false;
        dir.upsert(&inaccessible).unwrap();

        assert!(dir.random_accessible().unwrap().is_none());

        dir.upsert(&peer("alive")).unwrap();
        let picked = dir.random_accessible().unwrap().unwrap();
        assert_eq!(picked.sign_key, "alive");
    }
}
