use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ValidationError;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self::from_system_time(std::time::SystemTime::now())
    }

    /// Times before the epoch clamp to zero.
    pub fn from_system_time(time: std::time::SystemTime) -> Self {
        Self(
            time.duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_secs(self) -> u64 {
        self.0 / 1000
    }

    /// Time from `earlier` to `self`, zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: UnixTimeMs) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }
}

/// Two-valued reachability signal. `None` means "not yet determined".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityState {
    pub connected: Option<bool>,
    pub server_reachable: Option<bool>,
}

impl ReachabilityState {
    pub const UNKNOWN: Self = Self {
        connected: None,
        server_reachable: None,
    };

    pub fn offline() -> Self {
        Self {
            connected: Some(false),
            server_reachable: Some(false),
        }
    }

    /// Only a definite `false` counts as disconnected.
    pub fn is_disconnected(&self) -> bool {
        self.connected == Some(false)
    }

    pub fn is_online(&self) -> bool {
        self.connected == Some(true) && self.server_reachable == Some(true)
    }
}

/// Queue-unique action identifier. Stored ids are validated on read.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ActionId(String);

impl ActionId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::new("action id cannot be empty"));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(ValidationError::new(format!(
                "action id exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ValidationError::new(
                "action id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)",
            ));
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ActionId {
    type Error = ValidationError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<ActionId> for String {
    fn from(id: ActionId) -> Self {
        id.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        }
    }
}

/// A mutating request waiting for connectivity.
///
/// Field names match the persisted JSON layout; `data` and `timestamp` are
/// accepted on read for queues written by older clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAction {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub endpoint: String,
    #[serde(alias = "data", default)]
    pub payload: serde_json::Value,
    #[serde(alias = "timestamp")]
    pub enqueued_at: UnixTimeMs,
}

/// Caller-supplied part of an [`OfflineAction`]; id and timestamp are assigned
/// on enqueue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewAction {
    pub action_type: ActionType,
    pub endpoint: String,
    pub payload: serde_json::Value,
}

impl NewAction {
    pub fn new(
        action_type: ActionType,
        endpoint: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            action_type,
            endpoint: endpoint.into(),
            payload,
        }
    }

    pub fn create(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(ActionType::Create, endpoint, payload)
    }

    pub fn update(endpoint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(ActionType::Update, endpoint, payload)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(ActionType::Delete, endpoint, serde_json::Value::Null)
    }

    pub(crate) fn into_action(self, now: UnixTimeMs) -> OfflineAction {
        OfflineAction {
            id: ActionId::generate(),
            action_type: self.action_type,
            endpoint: self.endpoint,
            payload: self.payload,
            enqueued_at: now,
        }
    }
}

/// One file in the image cache directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// `None` when the file was found on disk with no mapping in this session.
    pub remote_url: Option<String>,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub last_modified: UnixTimeMs,
}

impl CacheEntry {
    pub fn age(&self, now: UnixTimeMs) -> Duration {
        now.saturating_duration_since(self.last_modified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reachability_starts_unknown() {
        let state = ReachabilityState::default();
        assert_eq!(state, ReachabilityState::UNKNOWN);
        assert!(!state.is_disconnected());
        assert!(!state.is_online());
    }

    #[test]
    fn test_action_id_validation() {
        assert!(ActionId::new("").is_err());
        assert!(ActionId::new("has space").is_err());
        assert!(ActionId::new("a".repeat(129)).is_err());
        assert_eq!(ActionId::new("  ok-id_1 ").unwrap().as_str(), "ok-id_1");
    }

    #[test]
    fn test_generated_action_ids_are_unique() {
        let a = ActionId::generate();
        let b = ActionId::generate();
        assert_ne!(a, b);
        assert!(ActionId::new(a.as_str()).is_ok());
    }

    #[test]
    fn test_offline_action_json_layout() {
        let action = OfflineAction {
            id: ActionId::new("abc").unwrap(),
            action_type: ActionType::Create,
            endpoint: "/api/orders/".into(),
            payload: json!({"id": 1}),
            enqueued_at: UnixTimeMs(42),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "create");
        assert_eq!(value["enqueuedAt"], 42);
        assert_eq!(value["payload"]["id"], 1);
    }

    #[test]
    fn test_offline_action_accepts_legacy_field_names() {
        let raw = r#"{"id":"x1","type":"delete","endpoint":"/api/cart/3/","data":null,"timestamp":7}"#;
        let action: OfflineAction = serde_json::from_str(raw).unwrap();
        assert_eq!(action.action_type, ActionType::Delete);
        assert_eq!(action.enqueued_at, UnixTimeMs(7));
    }

    #[test]
    fn test_stored_action_with_invalid_id_is_rejected() {
        let raw = r#"{"id":"has space","type":"delete","endpoint":"/api/cart/3/","enqueuedAt":7}"#;
        assert!(serde_json::from_str::<OfflineAction>(raw).is_err());
        let raw = r#"{"id":"","type":"delete","endpoint":"/api/cart/3/","enqueuedAt":7}"#;
        assert!(serde_json::from_str::<OfflineAction>(raw).is_err());
    }

    #[test]
    fn test_unix_time_duration_since_saturates() {
        let earlier = UnixTimeMs(5_000);
        let later = UnixTimeMs(8_000);
        assert_eq!(later.saturating_duration_since(earlier), Duration::from_secs(3));
        assert_eq!(earlier.saturating_duration_since(later), Duration::ZERO);
    }
}
