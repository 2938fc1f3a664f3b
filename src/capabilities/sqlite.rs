//! SQLite-backed key-value store.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::kv::{check_value_size, KeyValueStore, KvError, StorageErrorCode, StorageKey};

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Durable store on a single SQLite file.
///
/// Statements are short and run inline under the connection lock.
pub struct SqliteKvStore {
    conn: Mutex<Connection>,
}

impl SqliteKvStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KvError::storage(
                    StorageErrorCode::IoError,
                    format!("failed to create directory {}: {}", parent.display(), e),
                )
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            KvError::storage(
                StorageErrorCode::ConnectionFailed,
                format!("failed to open database at {}: {}", path.display(), e),
            )
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            KvError::storage(StorageErrorCode::ConnectionFailed, e.to_string())
        })?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, KvError> {
        conn.execute_batch(KV_SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KvError> {
        self.conn
            .lock()
            .map_err(|e| KvError::storage(StorageErrorCode::Locked, format!("lock poisoned: {e}")))
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<String>, KvError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite_error)
    }

    async fn set(&self, key: &StorageKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        let now = crate::model::UnixTimeMs::now().0 as i64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key.as_str(), value, now],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), KvError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key.as_str()])
            .map_err(map_sqlite_error)?;
        Ok(())
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> KvError {
    use rusqlite::ErrorCode;

    let code = match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) => StorageErrorCode::Busy,
        Some(ErrorCode::DatabaseLocked) => StorageErrorCode::Locked,
        Some(ErrorCode::DiskFull) => StorageErrorCode::DiskFull,
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StorageErrorCode::Corrupted
        }
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::ReadOnly) => {
            StorageErrorCode::PermissionDenied
        }
        Some(ErrorCode::SystemIoFailure) => StorageErrorCode::IoError,
        _ => StorageErrorCode::Unknown,
    };
    KvError::storage(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = StorageKey::access_token();

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, "a".into()).await.unwrap();
        store.set(&key, "b".into()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("b"));

        store.remove(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("kv.db");

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store
                .set(&StorageKey::offline_queue(), "[1,2]".into())
                .await
                .unwrap();
        }

        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(
            store.get(&StorageKey::offline_queue()).await.unwrap().as_deref(),
            Some("[1,2]")
        );
    }
}
