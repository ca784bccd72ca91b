//! Cache for the large mutable payloads (user comments, avatars, channel
//! descriptions) that the wire identifies by hash and ships on demand.
//!
//! Backed by a single-file SQLite database; with no path configured the
//! database lives in memory and the cache is per-session only.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    UserComment,
    UserTexture,
    ChannelDescription,
}

impl BlobKind {
    fn as_str(self) -> &'static str {
        match self {
            BlobKind::UserComment => "user_comment",
            BlobKind::UserTexture => "user_texture",
            BlobKind::ChannelDescription => "channel_description",
        }
    }
}

pub struct BlobCache {
    conn: Mutex<Connection>,
}

impl BlobCache {
    /// Open the cache at `path`, or in memory when `None`.
    pub fn open(path: Option<&Path>) -> Result<Self, Error> {
        let conn = match path {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute(
            "CREATE TABLE IF NOT EXISTS blobs (
                kind    TEXT NOT NULL,
                entity  TEXT NOT NULL,
                hash    BLOB NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (kind, entity)
            )",
            [],
        )?;
        Ok(BlobCache {
            conn: Mutex::new(conn),
        })
    }

    /// Store the current payload for an entity, replacing any previous one.
    pub fn put(&self, kind: BlobKind, entity: &str, hash: &[u8], payload: &[u8]) {
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO blobs (kind, entity, hash, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (kind, entity) DO UPDATE SET hash = ?3, payload = ?4",
            params![kind.as_str(), entity, hash, payload],
        );
        if let Err(e) = result {
            log::error!("failed to store {} blob for {entity}: {e}", kind.as_str());
        }
    }

    /// The cached payload for an entity, regardless of freshness.
    pub fn get(&self, kind: BlobKind, entity: &str) -> Option<Vec<u8>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT payload FROM blobs WHERE kind = ?1 AND entity = ?2",
            params![kind.as_str(), entity],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            log::error!("failed to read {} blob for {entity}: {e}", kind.as_str());
            None
        })
    }

    /// Whether the cached payload for an entity carries exactly this hash.
    /// A match means the cache is current and no fetch is needed.
    pub fn has(&self, kind: BlobKind, entity: &str, hash: &[u8]) -> bool {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT 1 FROM blobs WHERE kind = ?1 AND entity = ?2 AND hash = ?3",
            params![kind.as_str(), entity, hash],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or_else(|e| {
            log::error!("failed to probe {} blob for {entity}: {e}", kind.as_str());
            None
        })
        .is_some()
    }
}
