use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::capabilities::{HttpError, HttpRequest, HttpResponse, HttpTransport, DEFAULT_TIMEOUT_MS};
use crate::config::RetryPolicy;
use crate::connectivity::ConnectivityMonitor;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Additional attempts after the first, for transport failures only.
    pub max_retries: u32,
    pub notify_on_failure: bool,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            notify_on_failure: true,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl ExecuteOptions {
    /// For background callers that must not bother the user.
    pub fn silent() -> Self {
        Self {
            notify_on_failure: false,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("device is offline")]
    NoConnectivity,

    #[error("no response after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: HttpError,
    },

    /// Anything that is not a transport failure; never retried.
    #[error(transparent)]
    Http(HttpError),
}

impl RequestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::NoConnectivity => ErrorKind::NoConnectivity,
            RequestError::Transport { .. } => ErrorKind::TransportFailure,
            RequestError::Http(e) => e.kind(),
        }
    }

    pub fn http_error(&self) -> Option<&HttpError> {
        match self {
            RequestError::NoConnectivity => None,
            RequestError::Transport { source, .. } => Some(source),
            RequestError::Http(e) => Some(e),
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.http_error().and_then(HttpError::status)
    }
}

/// Receives user-facing failure notices for calls made with
/// `notify_on_failure` set.
pub trait FailureNotifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Default notifier: writes the notice to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl FailureNotifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        warn!(title, "{}", message);
    }
}

/// Runs request operations under the connectivity gate and the retry policy.
#[derive(Clone)]
pub struct RequestExecutor {
    monitor: ConnectivityMonitor,
    policy: RetryPolicy,
    notifier: Arc<dyn FailureNotifier>,
}

impl RequestExecutor {
    pub fn new(monitor: ConnectivityMonitor, policy: RetryPolicy) -> Self {
        Self {
            monitor,
            policy,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailureNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// [`ExecuteOptions::default`] with the retry budget from the policy.
    pub fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions::default().with_max_retries(self.policy.default_max_retries)
    }

    /// Invokes `operation` until it succeeds, fails with a non-transport
    /// error, or runs out of retries.
    ///
    /// Before every attempt the monitor's `connected` flag is consulted; only
    /// a definite `false` fails fast with [`RequestError::NoConnectivity`].
    /// Backoff before retry `k` is `min(base * 2^k, max)`.
    pub async fn execute<T, F, Fut>(
        &self,
        mut operation: F,
        options: ExecuteOptions,
    ) -> Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let mut retries = 0u32;
        loop {
            if self.monitor.current_state().is_disconnected() {
                debug!(retries, "offline, not attempting request");
                self.notify(ErrorKind::NoConnectivity, &options);
                return Err(RequestError::NoConnectivity);
            }

            let outcome = match tokio::time::timeout(options.timeout, operation()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(HttpError::Timeout {
                    timeout_ms: options.timeout.as_millis() as u64,
                    request_id: String::new(),
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport() => {
                    if retries < options.max_retries {
                        retries += 1;
                        let delay = self.policy.delay_for(retries);
                        warn!(
                            retry = retries,
                            max_retries = options.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            "transport failure, retrying: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    warn!(
                        attempts = retries + 1,
                        severity = ?ErrorKind::TransportFailure.default_severity(),
                        "giving up after transport failures: {}",
                        e
                    );
                    self.notify(ErrorKind::TransportFailure, &options);
                    return Err(RequestError::Transport {
                        attempts: retries + 1,
                        source: e,
                    });
                }
                Err(e) => return Err(RequestError::Http(e)),
            }
        }
    }

    /// Sends `request` through `transport`, re-sending a fresh copy on every
    /// attempt. Non-2xx responses become [`RequestError::Http`].
    #[instrument(skip(self, transport, request, options), fields(request_id = %request.request_id(), method = request.method().as_str()))]
    pub async fn send(
        &self,
        transport: &dyn HttpTransport,
        request: HttpRequest,
        options: ExecuteOptions,
    ) -> Result<HttpResponse, RequestError> {
        let request_id = request.request_id().to_string();
        self.execute(
            || {
                let request = request.clone();
                let request_id = request_id.clone();
                async move {
                    transport
                        .send(request)
                        .await?
                        .error_for_status(&request_id)
                }
            },
            options,
        )
        .await
    }

    fn notify(&self, kind: ErrorKind, options: &ExecuteOptions) {
        if !options.notify_on_failure {
            return;
        }
        let title = match kind {
            ErrorKind::NoConnectivity => "No Internet Connection",
            _ => "Connection Error",
        };
        self.notifier.notify(title, kind.user_facing_message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::testing::{Scripted, ScriptedTransport};
    use crate::connectivity::NetworkEvent;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    const BASE: &str = "http://api.test/";

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<(String, String)>>,
    }

    impl FailureNotifier for RecordingNotifier {
        fn notify(&self, title: &str, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
        }
    }

    fn refused() -> HttpError {
        HttpError::Connection {
            host: "api.test".into(),
            message: "connection refused".into(),
        }
    }

    async fn executor(connected: Option<bool>) -> (RequestExecutor, Arc<RecordingNotifier>) {
        let transport = Arc::new(ScriptedTransport::new().on(BASE, Scripted::status(200)));
        let monitor = ConnectivityMonitor::new(transport, BASE, Duration::from_secs(5)).unwrap();
        if connected.is_some() {
            monitor
                .handle_network_event(NetworkEvent::connected(connected))
                .await;
        }
        let notifier = Arc::new(RecordingNotifier::default());
        let executor =
            RequestExecutor::new(monitor, RetryPolicy::default()).with_notifier(notifier.clone());
        (executor, notifier)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_retries_means_three_calls_and_backoff() {
        let (executor, notifier) = executor(Some(true)).await;
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(refused()) }
                },
                ExecuteOptions::default().with_max_retries(2),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(2_000 + 4_000));
        assert!(matches!(
            result,
            Err(RequestError::Transport { attempts: 3, .. })
        ));
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_two_then_four_seconds() {
        let (executor, _) = executor(Some(true)).await;
        let started = Instant::now();
        let offsets = Mutex::new(Vec::new());

        let _: Result<(), _> = executor
            .execute(
                || {
                    offsets
                        .lock()
                        .unwrap()
                        .push(started.elapsed().as_millis() as u64);
                    async { Err(refused()) }
                },
                ExecuteOptions::silent().with_max_retries(2),
            )
            .await;

        assert_eq!(*offsets.lock().unwrap(), vec![0, 2_000, 6_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_options_follow_policy_retry_budget() {
        let transport = Arc::new(ScriptedTransport::new());
        let monitor = ConnectivityMonitor::new(transport, BASE, Duration::from_secs(5)).unwrap();
        let policy = RetryPolicy {
            default_max_retries: 0,
            ..RetryPolicy::default()
        };
        let executor = RequestExecutor::new(monitor, policy);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(refused()) }
                },
                executor.default_options(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RequestError::Transport { attempts: 1, .. })));
        assert_eq!(executor.default_options().timeout, ExecuteOptions::default().timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let (executor, _) = executor(Some(true)).await;
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n == 0 {
                            Err(refused())
                        } else {
                            Ok("done")
                        }
                    }
                },
                ExecuteOptions::default(),
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_not_retried() {
        let (executor, notifier) = executor(Some(true)).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(HttpError::HttpStatus {
                            status: 503,
                            message: "unavailable".into(),
                            request_id: "r".into(),
                        })
                    }
                },
                ExecuteOptions::default().with_max_retries(5),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(err.status(), Some(503));
        assert!(notifier.notices.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_fast_without_calling() {
        let (executor, notifier) = executor(Some(false)).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                ExecuteOptions::default(),
            )
            .await;

        assert_eq!(result, Err(RequestError::NoConnectivity));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "No Internet Connection");
    }

    #[tokio::test]
    async fn test_unknown_connectivity_still_attempts() {
        let (executor, _) = executor(None).await;
        assert_eq!(executor.monitor.current_state().connected, None);

        let result = executor
            .execute(|| async { Ok::<_, HttpError>(7) }, ExecuteOptions::silent())
            .await;

        assert_eq!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_between_attempts_stops_retrying() {
        let (executor, _) = executor(Some(true)).await;
        let monitor = executor.monitor.clone();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let monitor = monitor.clone();
                    async move {
                        monitor
                            .handle_network_event(NetworkEvent::connected(Some(false)))
                            .await;
                        Err(refused())
                    }
                },
                ExecuteOptions::silent(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result, Err(RequestError::NoConnectivity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_transport_failure() {
        let (executor, _) = executor(Some(true)).await;
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = executor
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                },
                ExecuteOptions::silent()
                    .with_max_retries(1)
                    .with_timeout(Duration::from_secs(1)),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(RequestError::Transport { attempts, source }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(source, HttpError::Timeout { timeout_ms: 1_000, .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_maps_statuses() {
        let transport = ScriptedTransport::new()
            .on("/api/orders/", Scripted::json(201, serde_json::json!({"id": 1})))
            .on("/api/missing/", Scripted::json(404, serde_json::json!({"detail": "Not found."})));
        let (executor, _) = executor(None).await;

        let ok = executor
            .send(
                &transport,
                HttpRequest::get("http://api.test/api/orders/").unwrap(),
                ExecuteOptions::silent(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status, 201);

        let err = executor
            .send(
                &transport,
                HttpRequest::get("http://api.test/api/missing/").unwrap(),
                ExecuteOptions::silent(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(transport.calls_to("/api/missing/"), 1);
    }

    proptest! {
        #[test]
        fn prop_calls_are_bounded_by_max_retries(max_retries in 0u32..6) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let calls = runtime.block_on(async {
                let (executor, _) = executor(Some(true)).await;
                let calls = AtomicU32::new(0);
                let _ = executor
                    .execute(
                        || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async { Err::<(), _>(refused()) }
                        },
                        ExecuteOptions::silent().with_max_retries(max_retries),
                    )
                    .await;
                calls.load(Ordering::SeqCst)
            });
            prop_assert_eq!(calls, max_retries + 1);
        }
    }
}
