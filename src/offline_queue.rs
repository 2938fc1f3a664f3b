//! Durable FIFO of mutating requests made while offline, plus keyed offline
//! data snapshots.
//!
//! Storage failures are logged and the operation becomes a no-op; the `try_*`
//! variants expose the error for callers that want it.
//!
//! Writes to the stored queue are serialized, and a drain keeps anything
//! enqueued while its replays were in flight. [`OfflineQueue::drain`] itself
//! is not reentrant: two concurrent drains may replay an action twice. Drive
//! it from a single coordinator.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::capabilities::{get_json, set_json, KeyValueStore, KvError, StorageKey};
use crate::model::{ActionId, NewAction, OfflineAction, UnixTimeMs};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("offline storage failed: {0}")]
    Storage(#[from] KvError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub retained: usize,
    /// Retained because `replay` returned an error.
    pub errored: usize,
}

/// Stored offline data together with the time it was saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineSnapshot<T> {
    pub data: T,
    pub timestamp: UnixTimeMs,
}

#[derive(Serialize)]
struct SnapshotRef<'a, T> {
    data: &'a T,
    timestamp: UnixTimeMs,
}

/// Cheap to clone; clones share the write lock.
#[derive(Clone)]
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    // Held for every read-modify-write of the stored queue, never across a
    // replay.
    writes: Arc<Mutex<()>>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Appends `action` with a fresh id and timestamp. `None` if it could not
    /// be persisted.
    pub async fn enqueue(&self, action: NewAction) -> Option<ActionId> {
        match self.try_enqueue(action).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("failed to queue offline action: {}", e);
                None
            }
        }
    }

    #[instrument(skip(self, action), fields(action_type = action.action_type.as_str(), endpoint = %action.endpoint))]
    pub async fn try_enqueue(&self, action: NewAction) -> Result<ActionId, QueueError> {
        let _write = self.writes.lock().await;
        let mut queue = self.load().await?;
        let action = action.into_action(UnixTimeMs::now());
        let id = action.id.clone();
        queue.push(action);
        set_json(self.store.as_ref(), &StorageKey::offline_queue(), &queue).await?;
        info!(id = %id, pending = queue.len(), "action queued for offline replay");
        Ok(id)
    }

    /// Queued actions in enqueue order; empty if storage fails.
    pub async fn pending(&self) -> Vec<OfflineAction> {
        self.load().await.unwrap_or_else(|e| {
            error!("failed to read offline queue: {}", e);
            Vec::new()
        })
    }

    pub async fn try_pending(&self) -> Result<Vec<OfflineAction>, QueueError> {
        self.load().await
    }

    /// Replays every queued action in order. Actions for which `replay`
    /// returns `Ok(true)` are dropped; `Ok(false)` and `Err` keep them, in
    /// their original relative order, followed by anything enqueued during
    /// the drain. An empty remainder removes the key.
    #[instrument(skip(self, replay))]
    pub async fn drain<F, Fut, E>(&self, mut replay: F) -> DrainReport
    where
        F: FnMut(OfflineAction) -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: Display,
    {
        let queue = match self.load().await {
            Ok(queue) => queue,
            Err(e) => {
                error!("failed to load offline queue: {}", e);
                return DrainReport::default();
            }
        };

        let key = StorageKey::offline_queue();
        if queue.is_empty() {
            let _write = self.writes.lock().await;
            // Only an empty queue may be removed; an enqueue may have won the lock.
            if matches!(self.load().await, Ok(ref current) if current.is_empty()) {
                if let Err(e) = self.store.remove(&key).await {
                    warn!("failed to remove empty offline queue: {}", e);
                }
            }
            return DrainReport::default();
        }

        info!(count = queue.len(), "processing offline actions");
        let replayed_ids: HashSet<ActionId> = queue.iter().map(|a| a.id.clone()).collect();
        let mut report = DrainReport::default();
        let mut remaining = Vec::new();
        for action in queue {
            match replay(action.clone()).await {
                Ok(true) => report.replayed += 1,
                Ok(false) => remaining.push(action),
                Err(e) => {
                    warn!(id = %action.id, "offline action replay failed: {}", e);
                    report.errored += 1;
                    remaining.push(action);
                }
            }
        }
        report.retained = remaining.len();

        let _write = self.writes.lock().await;
        match self.load().await {
            Ok(current) => {
                let added: Vec<OfflineAction> = current
                    .into_iter()
                    .filter(|a| !replayed_ids.contains(&a.id))
                    .collect();
                if !added.is_empty() {
                    info!(count = added.len(), "keeping actions queued during replay");
                    remaining.extend(added);
                }
            }
            Err(e) => {
                error!("cannot re-read offline queue, leaving it as stored: {}", e);
                return report;
            }
        }

        let persisted = if remaining.is_empty() {
            self.store.remove(&key).await
        } else {
            set_json(self.store.as_ref(), &key, &remaining).await
        };
        match persisted {
            Ok(()) if remaining.is_empty() => info!("offline queue processed"),
            Ok(()) => info!(pending = remaining.len(), "actions remain in offline queue"),
            Err(e) => error!("failed to persist offline queue after replay: {}", e),
        }
        report
    }

    /// Stores `data` under `@offline_data:<key>` with the current time.
    pub async fn save_offline_data<T>(&self, key: &str, data: &T)
    where
        T: Serialize + Sync,
    {
        if let Err(e) = self.try_save_offline_data(key, data).await {
            error!(key, "failed to save offline data: {}", e);
        }
    }

    pub async fn try_save_offline_data<T>(&self, key: &str, data: &T) -> Result<(), QueueError>
    where
        T: Serialize + Sync,
    {
        let snapshot = SnapshotRef {
            data,
            timestamp: UnixTimeMs::now(),
        };
        set_json(self.store.as_ref(), &StorageKey::offline_data(key)?, &snapshot).await?;
        Ok(())
    }

    pub async fn get_offline_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_offline_snapshot(key).await.map(|s| s.data)
    }

    pub async fn get_offline_snapshot<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Option<OfflineSnapshot<T>> {
        self.try_get_offline_snapshot(key)
            .await
            .unwrap_or_else(|e| {
                error!(key, "failed to read offline data: {}", e);
                None
            })
    }

    pub async fn try_get_offline_snapshot<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<OfflineSnapshot<T>>, QueueError> {
        Ok(get_json(self.store.as_ref(), &StorageKey::offline_data(key)?).await?)
    }

    async fn load(&self) -> Result<Vec<OfflineAction>, QueueError> {
        Ok(get_json(self.store.as_ref(), &StorageKey::offline_queue())
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::FailingKvStore;
    use crate::capabilities::MemoryKvStore;
    use crate::model::ActionType;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn queue() -> (OfflineQueue, Arc<MemoryKvStore>) {
        let store = Arc::new(MemoryKvStore::new());
        (OfflineQueue::new(store.clone()), store)
    }

    fn index_of(action: &OfflineAction) -> u64 {
        action.payload["i"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_id_and_timestamp() {
        let (queue, _) = queue();
        let before = UnixTimeMs::now();

        let id = queue
            .enqueue(NewAction::create("/api/orders/", json!({"id": 1})))
            .await
            .unwrap();

        let pending = queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].action_type, ActionType::Create);
        assert!(pending[0].enqueued_at >= before);
    }

    #[tokio::test]
    async fn test_full_drain_removes_key() {
        let (queue, store) = queue();
        queue.enqueue(NewAction::create("/api/orders/", json!({"id": 1}))).await;
        queue.enqueue(NewAction::delete("/api/cart/3/")).await;

        let report = queue
            .drain(|_| async { Ok::<_, String>(true) })
            .await;

        assert_eq!(report.replayed, 2);
        assert_eq!(report.retained, 0);
        assert_eq!(store.get(&StorageKey::offline_queue()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drain_retains_failures_in_order() {
        let (queue, _) = queue();
        for i in 0..4 {
            queue
                .enqueue(NewAction::update(format!("/api/items/{i}/"), json!({"i": i})))
                .await;
        }

        let report = queue
            .drain(|action| async move {
                match index_of(&action) {
                    1 => Err("boom".to_string()),
                    3 => Ok(false),
                    _ => Ok(true),
                }
            })
            .await;

        assert_eq!(
            report,
            DrainReport {
                replayed: 2,
                retained: 2,
                errored: 1
            }
        );
        let remaining: Vec<u64> = queue.pending().await.iter().map(index_of).collect();
        assert_eq!(remaining, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_action_queued_during_replay_survives_drain() {
        let (queue, _) = queue();
        queue
            .enqueue(NewAction::create("/api/orders/", json!({"i": 0})))
            .await;

        let writer = queue.clone();
        let report = queue
            .drain(move |_| {
                let writer = writer.clone();
                async move {
                    writer
                        .enqueue(NewAction::create("/api/orders/", json!({"i": 1})))
                        .await;
                    Ok::<_, String>(true)
                }
            })
            .await;

        assert_eq!(report.replayed, 1);
        assert_eq!(report.retained, 0);
        let remaining: Vec<u64> = queue.pending().await.iter().map(index_of).collect();
        assert_eq!(remaining, vec![1]);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_all_kept() {
        let (queue, _) = queue();
        let writers: Vec<_> = (0..10)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    queue
                        .enqueue(NewAction::create("/api/orders/", json!({"i": i})))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(queue.pending().await.len(), 10);
    }

    #[tokio::test]
    async fn test_drain_of_empty_queue_never_replays() {
        let (queue, store) = queue();
        store
            .set(&StorageKey::offline_queue(), "[]".into())
            .await
            .unwrap();

        let report = queue
            .drain(|_| async { Err::<bool, _>("unexpected replay".to_string()) })
            .await;

        assert_eq!(report, DrainReport::default());
        assert_eq!(store.get(&StorageKey::offline_queue()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reads_queue_written_with_legacy_fields() {
        let (queue, store) = queue();
        store
            .set(
                &StorageKey::offline_queue(),
                r#"[{"id":"k3j9x2","type":"create","endpoint":"/api/orders/","data":{"id":1},"timestamp":1700000000000}]"#.into(),
            )
            .await
            .unwrap();

        let pending = queue.pending().await;

        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!({"id": 1}));
        assert_eq!(pending[0].enqueued_at, UnixTimeMs(1_700_000_000_000));
    }

    #[tokio::test]
    async fn test_corrupt_queue_is_left_untouched() {
        let (queue, store) = queue();
        store
            .set(&StorageKey::offline_queue(), "{not json".into())
            .await
            .unwrap();

        let report = queue.drain(|_| async { Ok::<_, String>(true) }).await;

        assert_eq!(report, DrainReport::default());
        assert!(queue.try_pending().await.is_err());
        assert_eq!(
            store.get(&StorageKey::offline_queue()).await.unwrap().as_deref(),
            Some("{not json")
        );
    }

    #[tokio::test]
    async fn test_storage_failures_are_absorbed() {
        let queue = OfflineQueue::new(Arc::new(FailingKvStore));

        assert_eq!(queue.enqueue(NewAction::delete("/api/cart/1/")).await, None);
        assert!(queue.pending().await.is_empty());
        let report = queue
            .drain(|_| async { Err::<bool, _>("unexpected replay".to_string()) })
            .await;
        assert_eq!(report, DrainReport::default());

        queue.save_offline_data("products", &json!([1, 2])).await;
        assert_eq!(queue.get_offline_data::<serde_json::Value>("products").await, None);
    }

    #[tokio::test]
    async fn test_offline_data_round_trip() {
        let (queue, store) = queue();

        queue.save_offline_data("products", &json!([{"id": 7}])).await;

        let data: serde_json::Value = queue.get_offline_data("products").await.unwrap();
        assert_eq!(data, json!([{"id": 7}]));
        let raw = store
            .get(&StorageKey::new("@offline_data:products").unwrap())
            .await
            .unwrap()
            .unwrap();
        let stored: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(stored["timestamp"].is_u64());
        assert_eq!(queue.get_offline_data::<serde_json::Value>("missing").await, None);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (queue, _) = queue();
        for _ in 0..20 {
            queue.enqueue(NewAction::delete("/api/cart/1/")).await;
        }
        let ids: HashSet<_> = queue.pending().await.into_iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 20);
    }

    proptest! {
        #[test]
        fn prop_drain_keeps_exactly_the_failed_actions_in_order(
            outcomes in prop::collection::vec(any::<bool>(), 0..12)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let (remaining, key_present) = runtime.block_on(async {
                let (queue, store) = queue();
                for i in 0..outcomes.len() {
                    queue.enqueue(NewAction::create("/api/orders/", json!({"i": i}))).await;
                }
                let flags = outcomes.clone();
                queue
                    .drain(move |action| {
                        let ok = flags[index_of(&action) as usize];
                        async move { Ok::<_, String>(ok) }
                    })
                    .await;
                let remaining: Vec<u64> = queue.pending().await.iter().map(index_of).collect();
                let key_present = store.get(&StorageKey::offline_queue()).await.unwrap().is_some();
                (remaining, key_present)
            });

            let expected: Vec<u64> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, ok)| !**ok)
                .map(|(i, _)| i as u64)
                .collect();
            prop_assert_eq!(key_present, !expected.is_empty());
            prop_assert_eq!(remaining, expected);
        }
    }
}
