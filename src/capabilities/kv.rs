use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

const OFFLINE_QUEUE_KEY: &str = "@offline_queue";
const OFFLINE_DATA_PREFIX: &str = "@offline_data";
const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Validated key for the durable string store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self(key))
    }

    pub fn offline_queue() -> Self {
        Self(OFFLINE_QUEUE_KEY.to_string())
    }

    /// `@offline_data:<key>`
    pub fn offline_data(key: &str) -> Result<Self, KvError> {
        Self::new(format!("{OFFLINE_DATA_PREFIX}:{key}"))
    }

    pub fn access_token() -> Self {
        Self(ACCESS_TOKEN_KEY.to_string())
    }

    pub fn refresh_token() -> Self {
        Self(REFRESH_TOKEN_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control() && c != '\t') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Durable string-keyed persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &StorageKey) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &StorageKey, value: String) -> Result<(), KvError>;
    /// Removing a missing key is not an error.
    async fn remove(&self, key: &StorageKey) -> Result<(), KvError>;
}

#[async_trait]
impl<T: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<T> {
    async fn get(&self, key: &StorageKey) -> Result<Option<String>, KvError> {
        (**self).get(key).await
    }

    async fn set(&self, key: &StorageKey, value: String) -> Result<(), KvError> {
        (**self).set(key, value).await
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), KvError> {
        (**self).remove(key).await
    }
}

pub async fn get_json<S, T>(store: &S, key: &StorageKey) -> Result<Option<T>, KvError>
where
    S: KeyValueStore + ?Sized,
    T: DeserializeOwned,
{
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| KvError::Serialization {
                message: e.to_string(),
                key: Some(key.to_string()),
            }),
        None => Ok(None),
    }
}

pub async fn set_json<S, T>(store: &S, key: &StorageKey, value: &T) -> Result<(), KvError>
where
    S: KeyValueStore + ?Sized,
    T: Serialize + Sync,
{
    let raw = serde_json::to_string(value).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: Some(key.to_string()),
    })?;
    store.set(key, raw).await
}

pub(crate) fn check_value_size(value: &str) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// Process-local store, for tests and hosts without durable storage.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(key.as_str()).cloned())
    }

    async fn set(&self, key: &StorageKey, value: String) -> Result<(), KvError> {
        check_value_size(&value)?;
        self.entries
            .write()
            .await
            .insert(key.as_str().to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> Result<(), KvError> {
        self.entries.write().await.remove(key.as_str());
        Ok(())
    }
}
