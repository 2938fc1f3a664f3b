use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::http::{
    HttpError, HttpHeaders, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
    MAX_RESPONSE_BODY_SIZE,
};

/// [`HttpTransport`] backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, HttpError> {
        let client = Client::builder()
            .user_agent(format!(
                "marketplace-shared/{}",
                option_env!("CARGO_PKG_VERSION").unwrap_or("0.1.0")
            ))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| HttpError::InvalidRequest {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let method = match request.method() {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, request.url().as_str())
            .timeout(request.timeout());
        for (name, value) in request.headers().iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }

        debug!(
            request_id = request.request_id(),
            method = request.method().as_str(),
            url = request.url().as_str(),
            "sending request"
        );

        let response = builder
            .send()
            .await
            .map_err(|e| classify(&request, e))?;

        let status = response.status().as_u16();
        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_BODY_SIZE {
                return Err(HttpError::ResponseTooLarge {
                    size: len as usize,
                    max: MAX_RESPONSE_BODY_SIZE,
                });
            }
        }

        let mut headers = HttpHeaders::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                // Server headers that fail our outbound validation are dropped.
                let _ = headers.insert(name.as_str(), value);
            }
        }

        let body = response.bytes().await.map_err(|e| classify(&request, e))?;
        if body.len() > MAX_RESPONSE_BODY_SIZE {
            return Err(HttpError::ResponseTooLarge {
                size: body.len(),
                max: MAX_RESPONSE_BODY_SIZE,
            });
        }

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(request: &HttpRequest, e: reqwest::Error) -> HttpError {
    let host = request.url().host().to_string();
    if e.is_timeout() {
        HttpError::Timeout {
            timeout_ms: request.timeout().as_millis() as u64,
            request_id: request.request_id().to_string(),
        }
    } else if e.is_connect() {
        HttpError::Connection {
            host,
            message: e.to_string(),
        }
    } else if e.is_body() || e.is_decode() {
        HttpError::InvalidResponse {
            reason: e.to_string(),
            request_id: request.request_id().to_string(),
        }
    } else if e.is_builder() {
        HttpError::InvalidRequest {
            reason: e.to_string(),
        }
    } else {
        // Redirect loops and dropped connections mid-request: nothing usable came back.
        HttpError::Connection {
            host,
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_host_is_transport_failure() {
        let transport = ReqwestTransport::new().unwrap();
        // Port 9 on loopback (discard) is closed on test hosts.
        let request = HttpRequest::get("http://127.0.0.1:9/")
            .unwrap()
            .with_timeout(std::time::Duration::from_secs(2))
            .unwrap();
        let err = transport.send(request).await.unwrap_err();
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }
}
