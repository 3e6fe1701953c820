//! Content fingerprint store.
//!
//! Maps `(connection, session, logical key)` to the SHA-256 hex digest of the
//! content last written or uploaded under that key. The in-memory map is the
//! fast path; every mutation is mirrored into the durable [`KvStore`] so that
//! "already submitted" survives restarts.

use crate::kv::{KvError, KvStore, BUCKET_FILE_HASHES};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Separator used in durable keys. Rejected inside key components.
pub const KEY_SEPARATOR: char = '\0';

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("fingerprint: key component contains the reserved separator - {0:?}")]
    InvalidKey(String),

    #[error("fingerprint: persistence failed - {0}")]
    Persistence(#[from] KvError),

    #[error("fingerprint: io error - {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, FingerprintError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FingerprintKey {
    connection: String,
    session: String,
    key: String,
}

impl FingerprintKey {
    fn new(connection: &str, session: &str, key: &str) -> Result<Self> {
        for part in [connection, session, key] {
            if part.contains(KEY_SEPARATOR) {
                return Err(FingerprintError::InvalidKey(part.to_string()));
            }
        }
        Ok(Self {
            connection: connection.to_string(),
            session: session.to_string(),
            key: key.to_string(),
        })
    }

    fn encode(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.connection,
            self.session,
            self.key,
            sep = KEY_SEPARATOR
        )
    }

    fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(3, KEY_SEPARATOR);
        Some(Self {
            connection: parts.next()?.to_string(),
            session: parts.next()?.to_string(),
            key: parts.next()?.to_string(),
        })
    }
}

/// One tracked fingerprint, as returned by the listing helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub connection: String,
    pub session: String,
    pub key: String,
    pub hash: String,
}

/// Fingerprint key for an uploaded order of a given game year.
pub fn order_key(year: u32) -> String {
    format!("order:{}", year)
}

/// SHA-256 of `data`, hex encoded.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn compute_file_hash(path: &Path) -> io::Result<String> {
    Ok(compute_hash(&fs::read(path)?))
}

fn short(hash: &str) -> &str {
    &hash[..16.min(hash.len())]
}

pub struct FingerprintStore {
    hashes: RwLock<HashMap<FingerprintKey, String>>,
    db: Arc<dyn KvStore>,
}

impl FingerprintStore {
    /// Open the store and load every persisted fingerprint into memory.
    pub fn open(db: Arc<dyn KvStore>) -> Result<Self> {
        let raw = db.get_all(BUCKET_FILE_HASHES)?;
        let mut hashes = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            match FingerprintKey::decode(&key) {
                Some(parsed) => {
                    hashes.insert(parsed, String::from_utf8_lossy(&value).into_owned());
                }
                None => log::warn!("fingerprint: skipping malformed key {:?}", key),
            }
        }
        log::debug!("fingerprint: loaded {} hashes", hashes.len());

        Ok(Self {
            hashes: RwLock::new(hashes),
            db,
        })
    }

    pub fn get(&self, connection: &str, session: &str, key: &str) -> Option<String> {
        let key = FingerprintKey::new(connection, session, key).ok()?;
        self.hashes.read().unwrap().get(&key).cloned()
    }

    /// Record `hash` under the key. The in-memory value is updated even when
    /// the durable write fails; the failure is still returned.
    pub fn set(&self, connection: &str, session: &str, key: &str, hash: &str) -> Result<()> {
        let key = FingerprintKey::new(connection, session, key)?;
        let encoded = key.encode();

        let mut hashes = self.hashes.write().unwrap();
        hashes.insert(key, hash.to_string());
        if let Err(e) = self.db.set(BUCKET_FILE_HASHES, &encoded, hash.as_bytes()) {
            log::error!(
                "fingerprint: failed to persist hash for {:?}: {}",
                encoded.replace(KEY_SEPARATOR, "/"),
                e
            );
            return Err(e.into());
        }
        Ok(())
    }

    /// True when `data` hashes differently from the stored value, or when
    /// nothing is stored.
    pub fn has_changed(&self, connection: &str, session: &str, key: &str, data: &[u8]) -> bool {
        let current = compute_hash(data);
        self.get(connection, session, key).as_deref() != Some(current.as_str())
    }

    /// Write `data` to `target` unless its fingerprint matches the stored one.
    /// The target path doubles as the logical key.
    pub fn write_if_changed(
        &self,
        connection: &str,
        session: &str,
        data: &[u8],
        target: &Path,
    ) -> Result<bool> {
        let key = target.to_string_lossy();
        let hash = compute_hash(data);
        let stored = self.get(connection, session, &key);

        if stored.as_deref() == Some(hash.as_str()) {
            log::debug!(
                "fingerprint: {} unchanged ({}...), skipping write",
                target.display(),
                short(&hash)
            );
            return Ok(false);
        }

        fs::write(target, data)?;

        if let Err(e) = self.set(connection, session, &key, &hash) {
            log::warn!(
                "fingerprint: {} written but hash not persisted: {}",
                target.display(),
                e
            );
        }

        log::debug!(
            "fingerprint: wrote {} ({}..., previously tracked: {})",
            target.display(),
            short(&hash),
            stored.is_some()
        );
        Ok(true)
    }

    pub fn forget(&self, connection: &str, session: &str, key: &str) -> Result<()> {
        let key = FingerprintKey::new(connection, session, key)?;
        self.hashes.write().unwrap().remove(&key);
        self.db.delete(BUCKET_FILE_HASHES, &key.encode())?;
        Ok(())
    }

    /// Drop every fingerprint of one session. Files on disk are untouched.
    pub fn forget_session(&self, connection: &str, session: &str) -> usize {
        let removed = self.remove_where(|k| k.connection == connection && k.session == session);
        log::debug!(
            "fingerprint: forgot {} hashes for session {} on {}",
            removed,
            session,
            connection
        );
        removed
    }

    pub fn forget_connection(&self, connection: &str) -> usize {
        let removed = self.remove_where(|k| k.connection == connection);
        log::debug!("fingerprint: forgot {} hashes for {}", removed, connection);
        removed
    }

    pub fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    fn remove_where(&self, pred: impl Fn(&FingerprintKey) -> bool) -> usize {
        let removed: Vec<FingerprintKey> = {
            let mut hashes = self.hashes.write().unwrap();
            let keys: Vec<_> = hashes.keys().filter(|k| pred(k)).cloned().collect();
            for key in &keys {
                hashes.remove(key);
            }
            keys
        };

        for key in &removed {
            if let Err(e) = self.db.delete(BUCKET_FILE_HASHES, &key.encode()) {
                log::warn!(
                    "fingerprint: failed to delete {}/{}/{}: {}",
                    key.connection,
                    key.session,
                    key.key,
                    e
                );
            }
        }
        removed.len()
    }

    pub fn tracked_count(&self) -> usize {
        self.hashes.read().unwrap().len()
    }

    pub fn all_files(&self) -> Vec<FingerprintEntry> {
        self.collect_where(|_| true)
    }

    pub fn session_files(&self, connection: &str, session: &str) -> Vec<FingerprintEntry> {
        self.collect_where(|k| k.connection == connection && k.session == session)
    }

    pub fn connection_files(&self, connection: &str) -> Vec<FingerprintEntry> {
        self.collect_where(|k| k.connection == connection)
    }

    fn collect_where(&self, pred: impl Fn(&FingerprintKey) -> bool) -> Vec<FingerprintEntry> {
        let mut out: Vec<FingerprintEntry> = self
            .hashes
            .read()
            .unwrap()
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, hash)| FingerprintEntry {
                connection: k.connection.clone(),
                session: k.session.clone(),
                key: k.key.clone(),
                hash: hash.clone(),
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.connection, &a.session, &a.key).cmp(&(&b.connection, &b.session, &b.key))
        });
        out
    }

    /// Hash the file at `path` and record it under its path. A missing file
    /// forgets the key and yields `None`.
    pub fn sync_file_hash(
        &self,
        connection: &str,
        session: &str,
        path: &Path,
    ) -> Result<Option<String>> {
        let key = path.to_string_lossy();
        match compute_file_hash(path) {
            Ok(hash) => {
                self.set(connection, session, &key, &hash)?;
                Ok(Some(hash))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget(connection, session, &key)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
