//! `ResilienceCore`: one explicitly constructed instance owning the
//! connectivity monitor, request executor, image cache, offline queue and
//! token manager, plus their background tasks.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTransport, KeyValueStore, ValidatedUrl,
};
use crate::config::CoreConfig;
use crate::connectivity::{ConnectivityMonitor, NetworkEvent};
use crate::error::CoreError;
use crate::executor::{ExecuteOptions, FailureNotifier, RequestError, RequestExecutor};
use crate::image_cache::{CleanupReport, ImageCache};
use crate::model::{ActionId, ActionType, NewAction, OfflineAction};
use crate::offline_queue::{DrainReport, OfflineQueue};
use crate::task::TaskHandle;
use crate::token::TokenManager;

/// Result of [`ResilienceCore::submit_mutation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    Sent(HttpResponse),
    /// Stored for replay once connectivity returns.
    Queued(ActionId),
}

struct CoreInner {
    config: CoreConfig,
    transport: Arc<dyn HttpTransport>,
    monitor: ConnectivityMonitor,
    executor: RequestExecutor,
    images: ImageCache,
    queue: OfflineQueue,
    tokens: TokenManager,
    // Serializes drains; the queue itself is not reentrant.
    replay_lock: tokio::sync::Mutex<()>,
}

pub struct ResilienceCore {
    inner: Arc<CoreInner>,
    tasks: Mutex<Vec<TaskHandle>>,
    cleanup: Mutex<Option<TaskHandle<Option<CleanupReport>>>>,
}

impl ResilienceCore {
    /// Builds every component, creates the image cache directory and starts
    /// the periodic recheck, the initial cache sweep and, when enabled,
    /// auto-replay on reconnect. Must be called within a Tokio runtime.
    #[instrument(skip_all, fields(api_base_url = %config.api_base_url))]
    pub async fn init(
        config: CoreConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, CoreError> {
        Self::init_with_notifier(config, transport, store, None).await
    }

    pub async fn init_with_notifier(
        config: CoreConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
        notifier: Option<Arc<dyn FailureNotifier>>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let monitor = ConnectivityMonitor::new(
            transport.clone(),
            &config.api_base_url,
            config.probe_timeout(),
        )?;
        let mut executor = RequestExecutor::new(monitor.clone(), config.retry.clone());
        if let Some(notifier) = notifier {
            executor = executor.with_notifier(notifier);
        }
        let images = ImageCache::new(
            config.cache.clone(),
            config.image_base_url.clone(),
            config.placeholder_image_url.clone(),
            transport.clone(),
        );
        let queue = OfflineQueue::new(store.clone());
        let tokens = TokenManager::new(store, transport.clone(), &config.api_base_url, &config.token)?;

        let cleanup = images.init().await?;

        let inner = Arc::new(CoreInner {
            config,
            transport,
            monitor,
            executor,
            images,
            queue,
            tokens,
            replay_lock: tokio::sync::Mutex::new(()),
        });

        let mut tasks = vec![inner
            .monitor
            .spawn_periodic_recheck(inner.config.recheck_interval())];
        if inner.config.auto_replay {
            tasks.push(spawn_auto_replay(inner.clone()));
        }

        info!("resilience core initialized");
        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Stops background tasks and drops in-memory image mappings.
    pub async fn dispose(&self) {
        let tasks: Vec<TaskHandle> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.abort();
        }
        if let Some(cleanup) = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            cleanup.abort();
        }
        self.inner.images.dispose().await;
        info!(stopped = tasks.len(), "resilience core disposed");
    }

    /// Feeds platform network notifications into the monitor until the
    /// sender is dropped or the core is disposed.
    pub fn attach_network_events(&self, events: mpsc::Receiver<NetworkEvent>) {
        let handle = self.inner.monitor.start(events);
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Waits for the sweep scheduled by `init`. `None` if it already ran to
    /// completion through an earlier call, was aborted, or failed.
    pub async fn wait_for_initial_cleanup(&self) -> Option<CleanupReport> {
        let handle = self
            .cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        handle.join().await.flatten()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    pub fn executor(&self) -> &RequestExecutor {
        &self.inner.executor
    }

    pub fn images(&self) -> &ImageCache {
        &self.inner.images
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.inner.tokens
    }

    /// Request options carrying the configured retry budget.
    pub fn default_options(&self) -> ExecuteOptions {
        self.inner.executor.default_options()
    }

    pub async fn resolve_image(&self, remote_url: Option<&str>) -> String {
        self.inner.images.resolve(remote_url).await
    }

    /// Unauthenticated request through the executor.
    pub async fn send(
        &self,
        request: HttpRequest,
        options: ExecuteOptions,
    ) -> Result<HttpResponse, RequestError> {
        self.inner.send(request, options).await
    }

    /// Refreshes the access token if needed, attaches it, and sends. A 401
    /// answer triggers one forced refresh and a single resend.
    pub async fn send_authenticated(
        &self,
        request: HttpRequest,
        options: ExecuteOptions,
    ) -> Result<HttpResponse, RequestError> {
        self.inner.send_authenticated(request, options).await
    }

    /// Sends a create/update/delete. When the device is offline or the
    /// backend never answered, the action is queued instead.
    #[instrument(skip(self, action, options), fields(action_type = action.action_type.as_str(), endpoint = %action.endpoint))]
    pub async fn submit_mutation(
        &self,
        action: NewAction,
        options: ExecuteOptions,
    ) -> Result<MutationOutcome, RequestError> {
        let request = self
            .inner
            .request_for(action.action_type, &action.endpoint, &action.payload)
            .map_err(RequestError::Http)?;

        match self.inner.send_authenticated(request, options).await {
            Ok(response) => Ok(MutationOutcome::Sent(response)),
            Err(e @ (RequestError::NoConnectivity | RequestError::Transport { .. })) => {
                match self.inner.queue.enqueue(action).await {
                    Some(id) => {
                        info!(id = %id, "mutation queued until connectivity returns");
                        Ok(MutationOutcome::Queued(id))
                    }
                    None => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the offline queue, resending each action; 2xx drops it.
    pub async fn replay_offline_queue(&self) -> DrainReport {
        self.inner.replay_offline_queue().await
    }
}

impl Drop for ResilienceCore {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            task.abort();
        }
    }
}

impl CoreInner {
    async fn send(
        &self,
        request: HttpRequest,
        options: ExecuteOptions,
    ) -> Result<HttpResponse, RequestError> {
        self.executor
            .send(self.transport.as_ref(), request, options)
            .await
    }

    async fn send_authenticated(
        &self,
        request: HttpRequest,
        options: ExecuteOptions,
    ) -> Result<HttpResponse, RequestError> {
        // Offline: the executor fails fast, so no refresh call goes out either.
        if self.monitor.current_state().is_disconnected() {
            debug!("offline, skipping token refresh");
        } else if !self.tokens.refresh_if_needed().await {
            debug!("no fresh access token, sending with what is stored");
        }
        let authorized = self.tokens.authorize(request.clone()).await;
        match self.send(authorized, options).await {
            Err(RequestError::Http(e)) if e.status() == Some(401) => {
                warn!("request unauthorized, forcing token refresh");
                if let Err(refresh_err) = self.tokens.refresh().await {
                    warn!(
                        requires_login = refresh_err.requires_login(),
                        "forced refresh failed: {}", refresh_err
                    );
                    return Err(RequestError::Http(e));
                }
                let authorized = self.tokens.authorize(request).await;
                self.send(authorized, options).await
            }
            other => other,
        }
    }

    fn request_for(
        &self,
        action_type: ActionType,
        endpoint: &str,
        payload: &serde_json::Value,
    ) -> Result<HttpRequest, HttpError> {
        let url = ValidatedUrl::join(&self.config.api_base_url, endpoint)?;
        match action_type {
            ActionType::Create => HttpRequest::new(HttpMethod::Post, url).with_json(payload),
            ActionType::Update => HttpRequest::new(HttpMethod::Put, url).with_json(payload),
            ActionType::Delete => Ok(HttpRequest::new(HttpMethod::Delete, url)),
        }
    }

    async fn replay_action(&self, action: OfflineAction) -> Result<bool, RequestError> {
        let request = self
            .request_for(action.action_type, &action.endpoint, &action.payload)
            .map_err(RequestError::Http)?;
        let response = self
            .send_authenticated(request, ExecuteOptions::silent().with_max_retries(0))
            .await?;
        Ok(response.is_success())
    }

    #[instrument(skip(self))]
    async fn replay_offline_queue(&self) -> DrainReport {
        let _guard = self.replay_lock.lock().await;
        self.queue
            .drain(|action| self.replay_action(action))
            .await
    }
}

fn spawn_auto_replay(inner: Arc<CoreInner>) -> TaskHandle {
    let mut changes = inner.monitor.subscribe();
    TaskHandle::spawn("offline-replay", async move {
        while let Some(change) = changes.recv().await {
            if change.is_reconnect() {
                let report = inner.replay_offline_queue().await;
                info!(
                    replayed = report.replayed,
                    retained = report.retained,
                    "offline queue replayed after reconnect"
                );
            }
        }
    })
}
