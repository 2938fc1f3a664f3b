//! Two-valued reachability tracking: device link (`connected`) and backend
//! liveness (`server_reachable`).
//!
//! State lives in a `watch` channel so readers always see the latest value;
//! transitions are fanned out on a `broadcast` channel. Probes have no critical
//! section: when two overlap, whichever completes last decides
//! `server_reachable`, except that a probe finishing after the link went down
//! never marks the server reachable.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{HttpError, HttpMethod, HttpRequest, HttpTransport, ValidatedUrl};
use crate::model::ReachabilityState;
use crate::task::TaskHandle;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Platform network-change notification. Only `is_connected` drives state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEvent {
    pub is_connected: Option<bool>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

impl NetworkEvent {
    pub fn connected(is_connected: Option<bool>) -> Self {
        Self {
            is_connected,
            kind: String::from("unknown"),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachabilityChange {
    pub previous: ReachabilityState,
    pub current: ReachabilityState,
}

impl ReachabilityChange {
    /// `connected` moved to `true` from anything else.
    pub fn is_reconnect(&self) -> bool {
        self.previous.connected != Some(true) && self.current.connected == Some(true)
    }
}

/// Receives every state transition published after it was created.
/// Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<ReachabilityChange>,
}

impl Subscription {
    /// `None` once the monitor is gone.
    pub async fn recv(&mut self) -> Option<ReachabilityChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("reachability subscriber lagged, skipped {} changes", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<ReachabilityChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

struct Inner {
    state: watch::Sender<ReachabilityState>,
    changes: broadcast::Sender<ReachabilityChange>,
    transport: Arc<dyn HttpTransport>,
    probe_url: ValidatedUrl,
    probe_timeout: Duration,
}

/// Cheap to clone; clones share state and subscribers.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl ConnectivityMonitor {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        api_base_url: &str,
        probe_timeout: Duration,
    ) -> Result<Self, HttpError> {
        let (state, _) = watch::channel(ReachabilityState::UNKNOWN);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                state,
                changes,
                transport,
                probe_url: ValidatedUrl::new(api_base_url)?,
                probe_timeout,
            }),
        })
    }

    pub fn current_state(&self) -> ReachabilityState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.changes.subscribe(),
        }
    }

    /// Latest-value view of the state, for consumers that only care about now.
    pub fn watch(&self) -> watch::Receiver<ReachabilityState> {
        self.inner.state.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    /// Applies a network-change notification and, unless the device reported
    /// itself offline, probes the backend before returning.
    #[instrument(skip(self, event), fields(is_connected = ?event.is_connected, kind = %event.kind))]
    pub async fn handle_network_event(&self, event: NetworkEvent) {
        self.update(|state| {
            state.connected = event.is_connected;
            if event.is_connected == Some(false) {
                state.server_reachable = Some(false);
            }
        });
        if event.is_connected != Some(false) {
            self.probe_and_apply().await;
        }
    }

    /// Forces a probe using the current `connected` flag. Resolves after the
    /// state has been updated.
    #[instrument(skip(self))]
    pub async fn recheck(&self) {
        if self.current_state().is_disconnected() {
            self.update(|state| state.server_reachable = Some(false));
            return;
        }
        self.probe_and_apply().await;
    }

    /// Consumes platform notifications until the sender side is dropped.
    pub fn start(&self, mut events: mpsc::Receiver<NetworkEvent>) -> TaskHandle {
        let monitor = self.clone();
        TaskHandle::spawn("connectivity-events", async move {
            while let Some(event) = events.recv().await {
                monitor.handle_network_event(event).await;
            }
            debug!("network event stream closed");
        })
    }

    /// Rechecks immediately and then every `interval`.
    pub fn spawn_periodic_recheck(&self, interval: Duration) -> TaskHandle {
        let monitor = self.clone();
        TaskHandle::spawn("connectivity-recheck", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.recheck().await;
            }
        })
    }

    async fn probe_and_apply(&self) {
        let reachable = self.probe().await;
        self.update(|state| {
            if state.connected == Some(false) {
                state.server_reachable = Some(false);
                return;
            }
            state.server_reachable = Some(reachable);
            // A response proves a link even before the platform reported one.
            if reachable && state.connected.is_none() {
                state.connected = Some(true);
            }
        });
    }

    /// Any response below 500 counts as reachable.
    async fn probe(&self) -> bool {
        let inner = &self.inner;
        let request = match HttpRequest::new(HttpMethod::Get, inner.probe_url.clone())
            .with_timeout(inner.probe_timeout)
        {
            Ok(request) => request,
            Err(e) => {
                warn!("probe request rejected: {}", e);
                return false;
            }
        };

        match tokio::time::timeout(inner.probe_timeout, inner.transport.send(request)).await {
            Ok(Ok(response)) => {
                debug!(status = response.status, "probe answered");
                response.status < 500
            }
            Ok(Err(e)) => {
                debug!("probe failed: {}", e);
                false
            }
            Err(_) => {
                debug!(timeout_ms = inner.probe_timeout.as_millis() as u64, "probe timed out");
                false
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut ReachabilityState)) {
        let mut previous = ReachabilityState::UNKNOWN;
        let mut current = ReachabilityState::UNKNOWN;
        let changed = self.inner.state.send_if_modified(|state| {
            previous = *state;
            apply(state);
            current = *state;
            previous != current
        });
        if changed {
            info!(
                connected = ?current.connected,
                server_reachable = ?current.server_reachable,
                "reachability changed"
            );
            // No subscribers is fine.
            let _ = self.inner.changes.send(ReachabilityChange { previous, current });
        }
    }
}
