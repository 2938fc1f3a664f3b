//! Network resilience core for the marketplace mobile clients.
//!
//! Tracks device and backend reachability, retries flaky requests with
//! exponential backoff, queues mutations made offline and replays them on
//! reconnect, caches remote images on disk, and keeps the JWT access token
//! fresh. Hosts construct a single [`ResilienceCore`] and supply an
//! [`HttpTransport`] and a [`KeyValueStore`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod capabilities;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod executor;
pub mod image_cache;
pub mod model;
pub mod offline_queue;
pub mod resilience;
pub mod task;
pub mod token;

pub use crate::capabilities::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, KeyValueStore, KvError,
    MemoryKvStore, StorageKey, ValidatedUrl,
};
#[cfg(feature = "http-client")]
pub use crate::capabilities::ReqwestTransport;
#[cfg(not(target_arch = "wasm32"))]
pub use crate::capabilities::SqliteKvStore;
pub use crate::config::{CoreConfig, ImageCacheConfig, RetryPolicy, TokenConfig};
pub use crate::connectivity::{ConnectivityMonitor, NetworkEvent, ReachabilityChange, Subscription};
pub use crate::resilience::{MutationOutcome, ResilienceCore};
pub use crate::error::{CoreError, ErrorKind, ErrorSeverity};
pub use crate::executor::{ExecuteOptions, FailureNotifier, LogNotifier, RequestError, RequestExecutor};
pub use crate::image_cache::{CleanupReport, ImageCache};
pub use crate::model::{
    ActionId, ActionType, CacheEntry, NewAction, OfflineAction, ReachabilityState, UnixTimeMs,
};
pub use crate::offline_queue::{DrainReport, OfflineQueue, OfflineSnapshot};
pub use crate::task::TaskHandle;
pub use crate::token::{Credentials, TokenError, TokenManager};
