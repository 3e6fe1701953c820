//! Bucket-scoped durable key-value storage.
//!
//! The fingerprint store mirrors every mutation into a [`KvStore`]. The
//! production backend is SQLite; [`MemoryStore`] backs tests and ephemeral
//! sessions.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use thiserror::Error;

/// Bucket holding content fingerprints.
pub const BUCKET_FILE_HASHES: &str = "file_hashes";

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv: sqlite error - {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("kv: io error - {0}")]
    Io(#[from] std::io::Error),
    #[error("kv: store is closed")]
    Closed,
}

pub trait KvStore: Send + Sync {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;
    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), KvError>;
    fn delete(&self, bucket: &str, key: &str) -> Result<(), KvError>;
    fn get_all(&self, bucket: &str) -> Result<HashMap<String, Vec<u8>>, KvError>;
}

pub struct SqliteStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, KvError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;

        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                bucket  TEXT NOT NULL,
                key     TEXT NOT NULL,
                value   BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the underlying connection. Later calls fail with [`KvError::Closed`].
    pub fn close(&self) -> Result<(), KvError> {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            conn.close().map_err(|(_, e)| KvError::Sqlite(e))?;
        }
        Ok(())
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, KvError> {
        let guard = self.conn.lock().unwrap();
        let conn = guard.as_ref().ok_or(KvError::Closed)?;
        Ok(f(conn)?)
    }
}

impl KvStore for SqliteStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE bucket = ? AND key = ?",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (bucket, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
                params![bucket, key, value],
            )
            .map(|_| ())
        })
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), KvError> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE bucket = ? AND key = ?",
                params![bucket, key],
            )
            .map(|_| ())
        })
    }

    fn get_all(&self, bucket: &str) -> Result<HashMap<String, Vec<u8>>, KvError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE bucket = ?")?;
            let mut rows = stmt.query(params![bucket])?;
            let mut out = HashMap::new();
            while let Some(row) = rows.next()? {
                out.insert(row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?);
            }
            Ok(out)
        })
    }
}

#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self
            .buckets
            .read()
            .unwrap()
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned())
    }

    fn set(&self, bucket: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.buckets
            .write()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<(), KvError> {
        if let Some(b) = self.buckets.write().unwrap().get_mut(bucket) {
            b.remove(key);
        }
        Ok(())
    }

    fn get_all(&self, bucket: &str) -> Result<HashMap<String, Vec<u8>>, KvError> {
        Ok(self
            .buckets
            .read()
            .unwrap()
            .get(bucket)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(tmp.path().join("turnsync.sqlite3")).unwrap();

        assert_eq!(store.get("b", "k").unwrap(), None);
        store.set("b", "k", b"v1").unwrap();
        store.set("b", "k", b"v2").unwrap();
        store.set("other", "k", b"x").unwrap();
        assert_eq!(store.get("b", "k").unwrap(), Some(b"v2".to_vec()));

        let all = store.get_all("b").unwrap();
        assert_eq!(all.len(), 1);

        store.delete("b", "k").unwrap();
        assert_eq!(store.get("b", "k").unwrap(), None);
        assert_eq!(store.get("other", "k").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_sqlite_store_closed() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(tmp.path().join("db.sqlite3")).unwrap();
        store.close().unwrap();
        assert!(matches!(store.set("b", "k", b"v"), Err(KvError::Closed)));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.set("b", "k", b"v").unwrap();
        assert_eq!(store.get("b", "k").unwrap(), Some(b"v".to_vec()));
        store.delete("b", "k").unwrap();
        assert!(store.get_all("b").unwrap().is_empty());
    }
}
