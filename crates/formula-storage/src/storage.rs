use crate::schema;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A stored value together with its write counter.
///
/// `version` increases by one on every successful write to the key, which lets
/// readers tell whether a value they observed earlier is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: String,
    pub version: i64,
}

/// SQLite-backed string key/value store.
///
/// Every handle owns one connection. Two handles opened on the same path (or
/// the same shared-cache URI) observe each other's writes, which is what lets
/// independent execution contexts rendezvous through the store.
#[derive(Debug, Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_uri(uri: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(uri, flags)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_versioned(key)?.map(|stored| stored.value))
    }

    pub fn get_versioned(&self, key: &str) -> Result<Option<StoredValue>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let row = conn
            .query_row(
                "SELECT value, version FROM kv WHERE key = ?1",
                params![key],
                |r| {
                    Ok(StoredValue {
                        value: r.get(0)?,
                        version: r.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Unconditionally write `value` under `key`.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO kv (key, value, version, updated_at)
            VALUES (?1, ?2, 1, CURRENT_TIMESTAMP)
            ON CONFLICT(key) DO UPDATE SET
              value = excluded.value,
              version = kv.version + 1,
              updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Write `value` only if the key is still at `expected_version`.
    ///
    /// `expected_version = None` means "only if the key is absent". Returns
    /// `false` (without writing) when another writer got there first; callers
    /// re-read and re-validate before trying again.
    pub fn compare_and_swap(
        &self,
        key: &str,
        expected_version: Option<i64>,
        value: &str,
    ) -> Result<bool> {
        validate_key(key)?;
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let changed = match expected_version {
            None => conn.execute(
                r#"
                INSERT INTO kv (key, value, version, updated_at)
                VALUES (?1, ?2, 1, CURRENT_TIMESTAMP)
                ON CONFLICT(key) DO NOTHING
                "#,
                params![key, value],
            )?,
            Some(version) => conn.execute(
                r#"
                UPDATE kv
                SET value = ?2, version = version + 1, updated_at = CURRENT_TIMESTAMP
                WHERE key = ?1 AND version = ?3
                "#,
                params![key, value, version],
            )?,
        };
        Ok(changed == 1)
    }

    /// Delete every key starting with `prefix`. Returns the number of removed keys.
    pub fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        // `substr` instead of LIKE so `%`/`_` inside keys are not wildcards.
        let changed = conn.execute(
            "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
            params![prefix],
        )?;
        Ok(changed)
    }

    pub fn len(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains('\0') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}
