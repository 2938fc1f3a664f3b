//! Shared fakes for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use shared::{HttpError, HttpRequest, HttpResponse, HttpTransport, UnixTimeMs};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub const API: &str = "http://api.test/";

/// Backend answering by URL suffix. A route's last answer repeats; requests
/// nobody routed fail like a refused connection.
#[derive(Default)]
pub struct FakeBackend {
    routes: Mutex<Vec<(String, VecDeque<u16>, serde_json::Value)>>,
    log: Mutex<Vec<HttpRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe target answers 200.
    pub fn reachable() -> Self {
        Self::new().route(API, &[200], serde_json::Value::Null)
    }

    pub fn route(self, suffix: &str, statuses: &[u16], body: serde_json::Value) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((suffix.to_string(), statuses.iter().copied().collect(), body));
        self
    }

    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url().as_str().ends_with(suffix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HttpTransport for FakeBackend {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = request.url().as_str().to_string();
        self.log.lock().unwrap().push(request);

        let mut routes = self.routes.lock().unwrap();
        let Some((_, statuses, body)) = routes.iter_mut().find(|(s, _, _)| url.ends_with(s.as_str()))
        else {
            return Err(HttpError::Connection {
                host: "api.test".into(),
                message: "connection refused".into(),
            });
        };
        let status = if statuses.len() > 1 {
            statuses.pop_front().unwrap()
        } else {
            statuses[0]
        };
        Ok(HttpResponse::new(status, body.to_string()))
    }
}

/// Unsigned JWT whose `exp` claim lies `secs` from now.
pub fn jwt_expiring_in(secs: u64) -> String {
    let exp = UnixTimeMs::now().as_secs() + secs;
    let claims = serde_json::json!({ "exp": exp, "user_id": 7 }).to_string();
    format!("e30.{}.signature", URL_SAFE_NO_PAD.encode(claims))
}

/// Polls `check` every 10ms for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
