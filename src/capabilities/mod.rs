//! Platform seams: HTTP transport and durable key-value storage.
//!
//! Every component talks to the outside world through these two traits, so
//! hosts can bridge them to native APIs and tests can script them.

mod http;
mod kv;
#[cfg(feature = "http-client")]
mod reqwest_transport;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::http::{
    error_detail, is_absolute_http, HttpError, HttpHeaders, HttpMethod, HttpRequest,
    HttpResponse, HttpTransport, ValidatedUrl, DEFAULT_TIMEOUT_MS,
};
pub use self::kv::{
    get_json, set_json, KeyValueStore, KvError, MemoryKvStore, StorageErrorCode, StorageKey,
};
#[cfg(feature = "http-client")]
pub use self::reqwest_transport::ReqwestTransport;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! Scripted doubles for the capability traits.

    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Respond(HttpResponse),
        Fail(HttpError),
        /// Wait (in tokio time) before producing the inner outcome.
        Delayed(Duration, Box<Scripted>),
    }

    impl Scripted {
        pub fn status(status: u16) -> Self {
            Scripted::Respond(HttpResponse::new(status, bytes::Bytes::new()))
        }

        pub fn json(status: u16, body: serde_json::Value) -> Self {
            Scripted::Respond(HttpResponse::new(status, body.to_string()))
        }

        pub fn bytes(status: u16, body: &'static [u8]) -> Self {
            Scripted::Respond(HttpResponse::new(status, bytes::Bytes::from_static(body)))
        }

        pub fn connection_refused() -> Self {
            Scripted::Fail(HttpError::Connection {
                host: "scripted".into(),
                message: "connection refused".into(),
            })
        }

        pub fn after(self, delay: Duration) -> Self {
            Scripted::Delayed(delay, Box::new(self))
        }
    }

    struct Route {
        url_suffix: String,
        outcomes: VecDeque<Scripted>,
    }

    /// Transport answering from per-route scripts keyed by URL suffix. The
    /// last outcome of a route repeats once its script is exhausted; unmatched
    /// requests fail with a connection error.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(self, url_suffix: &str, outcome: Scripted) -> Self {
            self.push(url_suffix, outcome);
            self
        }

        pub fn push(&self, url_suffix: &str, outcome: Scripted) {
            let mut routes = self.routes.lock().unwrap();
            match routes.iter_mut().find(|r| r.url_suffix == url_suffix) {
                Some(route) => route.outcomes.push_back(outcome),
                None => routes.push(Route {
                    url_suffix: url_suffix.to_string(),
                    outcomes: VecDeque::from([outcome]),
                }),
            }
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub fn calls_to(&self, url_suffix: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url().as_str().ends_with(url_suffix))
                .count()
        }

        fn next_outcome(&self, url: &str) -> Option<Scripted> {
            let mut routes = self.routes.lock().unwrap();
            let route = routes
                .iter_mut()
                .find(|r| url.ends_with(&r.url_suffix))?;
            if route.outcomes.len() > 1 {
                route.outcomes.pop_front()
            } else {
                route.outcomes.front().cloned()
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            let url = request.url().as_str().to_string();
            self.requests.lock().unwrap().push(request);

            let mut outcome = self
                .next_outcome(&url)
                .unwrap_or_else(Scripted::connection_refused);
            loop {
                match outcome {
                    Scripted::Respond(response) => return Ok(response),
                    Scripted::Fail(err) => return Err(err),
                    Scripted::Delayed(delay, inner) => {
                        tokio::time::sleep(delay).await;
                        outcome = *inner;
                    }
                }
            }
        }
    }

    /// Store whose every operation fails.
    #[derive(Debug, Default)]
    pub struct FailingKvStore;

    #[async_trait]
    impl KeyValueStore for FailingKvStore {
        async fn get(&self, _key: &StorageKey) -> Result<Option<String>, KvError> {
            Err(KvError::storage(StorageErrorCode::IoError, "disk unavailable"))
        }

        async fn set(&self, _key: &StorageKey, _value: String) -> Result<(), KvError> {
            Err(KvError::storage(StorageErrorCode::DiskFull, "disk full"))
        }

        async fn remove(&self, _key: &StorageKey) -> Result<(), KvError> {
            Err(KvError::storage(StorageErrorCode::IoError, "disk unavailable"))
        }
    }
}
