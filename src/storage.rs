//! Durable record storage behind the key and session stores.
//!
//! Records are opaque byte strings addressed by a [`Namespace`] and a string
//! key. Every record written by this crate starts with a format version byte
//! followed by a `bincode` encoding of a serde value.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Current schema version of the SQLite backend.
pub const SCHEMA_VERSION: i64 = 1;

/// Logical partitions of persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    KeyStore,
    Session,
    Identity,
}

impl Namespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::KeyStore => "keystore",
            Namespace::Session => "session",
            Namespace::Identity => "identity",
        }
    }
}

/// Durable key/value persistence.
///
/// Implementations must make `store` durable before returning `Ok`; callers
/// rely on that to keep in-memory state behind what was persisted.
pub trait Storage: Send + Sync {
    /// Loads a record, `None` if absent.
    fn load(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Inserts or replaces a record.
    fn store(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()>;

    /// Removes a record; removing an absent record is not an error.
    fn remove(&self, namespace: Namespace, key: &str) -> Result<()>;

    /// Lists all keys in a namespace.
    fn keys(&self, namespace: Namespace) -> Result<Vec<String>>;
}

/// In-memory storage. Clones share the same map, so a clone handed to a
/// fresh store behaves like reopening the same database.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    records: Arc<Mutex<HashMap<(Namespace, String), Vec<u8>>>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records across all namespaces.
    pub fn len(&self) -> Result<usize> {
        Ok(self.records.lock().map_err(|_| Error::StorageError)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl Storage for InMemoryStorage {
    fn load(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let records = self.records.lock().map_err(|_| Error::StorageError)?;
        Ok(records.get(&(namespace, key.to_owned())).cloned())
    }

    fn store(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| Error::StorageError)?;
        records.insert((namespace, key.to_owned()), value.to_vec());
        Ok(())
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| Error::StorageError)?;
        records.remove(&(namespace, key.to_owned()));
        Ok(())
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let records = self.records.lock().map_err(|_| Error::StorageError)?;
        Ok(records
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

/// SQLite-backed storage with a single `records` table.
pub struct SqliteStorage {
    connection: Mutex<Connection>,
}

impl SqliteStorage {
    /// Opens (creating if needed) a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::initialize(Connection::open(path)?)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(connection: Connection) -> Result<Self> {
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_info (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 version INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS records (
                 namespace TEXT NOT NULL,
                 key TEXT NOT NULL,
                 value BLOB NOT NULL,
                 updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                 PRIMARY KEY (namespace, key)
             );",
        )?;
        connection.execute(
            "INSERT OR IGNORE INTO schema_info (id, version) VALUES (1, ?1)",
            params![SCHEMA_VERSION],
        )?;

        let version: i64 =
            connection.query_row("SELECT version FROM schema_info WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        if version != SCHEMA_VERSION {
            tracing::error!(version, expected = SCHEMA_VERSION, "unsupported storage schema");
            return Err(Error::UnsupportedVersion(u8::try_from(version).unwrap_or(u8::MAX)));
        }

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    /// Schema version recorded in the database.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.connection.lock().map_err(|_| Error::StorageError)?;
        Ok(conn.query_row("SELECT version FROM schema_info WHERE id = 1", [], |row| row.get(0))?)
    }
}

impl Storage for SqliteStorage {
    fn load(&self, namespace: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.connection.lock().map_err(|_| Error::StorageError)?;
        Ok(conn
            .query_row(
                "SELECT value FROM records WHERE namespace = ?1 AND key = ?2",
                params![namespace.as_str(), key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn store(&self, namespace: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.connection.lock().map_err(|_| Error::StorageError)?;
        conn.execute(
            "INSERT INTO records (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = strftime('%s', 'now')",
            params![namespace.as_str(), key, value],
        )?;
        Ok(())
    }

    fn remove(&self, namespace: Namespace, key: &str) -> Result<()> {
        let conn = self.connection.lock().map_err(|_| Error::StorageError)?;
        conn.execute(
            "DELETE FROM records WHERE namespace = ?1 AND key = ?2",
            params![namespace.as_str(), key],
        )?;
        Ok(())
    }

    fn keys(&self, namespace: Namespace) -> Result<Vec<String>> {
        let conn = self.connection.lock().map_err(|_| Error::StorageError)?;
        let mut stmt = conn.prepare("SELECT key FROM records WHERE namespace = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![namespace.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

/// Encodes `value` as `version || bincode(value)`.
pub fn encode_versioned<T: Serialize>(version: u8, value: &T) -> Result<Vec<u8>> {
    let mut bytes = vec![version];
    bytes.extend(bincode::serde::encode_to_vec(value, bincode::config::standard())?);
    Ok(bytes)
}

/// Decodes a record written by [`encode_versioned`], rejecting other versions.
pub fn decode_versioned<T: DeserializeOwned>(expected: u8, bytes: &[u8]) -> Result<T> {
    let (&version, body) = bytes.split_first().ok_or(Error::DeserializationError)?;
    if version != expected {
        return Err(Error::UnsupportedVersion(version));
    }
    let (value, read) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
    if read != body.len() {
        return Err(Error::DeserializationError);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(storage: &dyn Storage) {
        assert_eq!(storage.load(Namespace::Session, "bob.1").unwrap(), None);

        storage.store(Namespace::Session, "bob.1", b"one").unwrap();
        storage.store(Namespace::Session, "bob.1", b"two").unwrap();
        storage.store(Namespace::Identity, "bob", b"key").unwrap();

        assert_eq!(
            storage.load(Namespace::Session, "bob.1").unwrap(),
            Some(b"two".to_vec())
        );
        assert_eq!(storage.keys(Namespace::Session).unwrap(), vec!["bob.1".to_owned()]);

        storage.remove(Namespace::Session, "bob.1").unwrap();
        storage.remove(Namespace::Session, "bob.1").unwrap();
        assert_eq!(storage.load(Namespace::Session, "bob.1").unwrap(), None);
        assert_eq!(
            storage.load(Namespace::Identity, "bob").unwrap(),
            Some(b"key".to_vec())
        );
    }

    #[test]
    fn test_in_memory_storage() {
        let storage = InMemoryStorage::new();
        exercise(&storage);
        assert_eq!(storage.len().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_storage() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        exercise(&storage);
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.store(Namespace::KeyStore, "state", b"persisted").unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(
            storage.load(Namespace::KeyStore, "state").unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[test]
    fn test_versioned_codec() {
        let bytes = encode_versioned(3, &(7u32, "value".to_owned())).unwrap();
        assert_eq!(bytes[0], 3);

        let decoded: (u32, String) = decode_versioned(3, &bytes).unwrap();
        assert_eq!(decoded, (7, "value".to_owned()));

        assert_eq!(
            decode_versioned::<(u32, String)>(4, &bytes).unwrap_err(),
            Error::UnsupportedVersion(3)
        );
        assert_eq!(
            decode_versioned::<(u32, String)>(3, &[]).unwrap_err(),
            Error::DeserializationError
        );
    }
}
