//! Access/refresh credential lifecycle.
//!
//! Credentials live in the durable store under `access_token` and
//! `refresh_token`. A missing or undecodable access token always counts as
//! expiring. Persisted state changes only on a successful refresh.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    HttpError, HttpMethod, HttpRequest, HttpTransport, KeyValueStore, KvError, StorageKey,
    ValidatedUrl,
};
use crate::config::TokenConfig;
use crate::model::UnixTimeMs;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no access token stored")]
    MissingAccessToken,

    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("credential storage failed: {0}")]
    Storage(#[from] KvError),

    #[error("refresh request failed: {0}")]
    Refresh(#[from] HttpError),

    #[error("refresh response has no access token")]
    MissingAccessInResponse,
}

impl TokenError {
    /// Whether the user has to sign in again rather than simply retry.
    pub fn requires_login(&self) -> bool {
        match self {
            TokenError::MissingRefreshToken | TokenError::MissingAccessInResponse => true,
            TokenError::Refresh(e) => matches!(e.status(), Some(401) | Some(403)),
            _ => false,
        }
    }
}

/// Both halves of a session, as returned by the login endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access: SecretString,
    pub refresh: SecretString,
}

impl Credentials {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: SecretString::new(access.into()),
            refresh: SecretString::new(refresh.into()),
        }
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: f64,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: Option<String>,
}

/// Reads the `exp` claim of a JWT without verifying its signature.
pub fn decode_expiry(token: &str) -> Result<UnixTimeMs, TokenError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(TokenError::Malformed("expected three segments".into())),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| TokenError::Malformed(format!("payload is not base64url: {e}")))?;
    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::Malformed(format!("invalid claims: {e}")))?;
    if !claims.exp.is_finite() || claims.exp < 0.0 {
        return Err(TokenError::Malformed("exp out of range".into()));
    }
    Ok(UnixTimeMs((claims.exp * 1000.0) as u64))
}

pub struct TokenManager {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn HttpTransport>,
    refresh_url: ValidatedUrl,
    expiry_buffer: Duration,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
        api_base_url: &str,
        config: &TokenConfig,
    ) -> Result<Self, HttpError> {
        Ok(Self {
            store,
            transport,
            refresh_url: ValidatedUrl::join(api_base_url, &config.refresh_path)?,
            expiry_buffer: config.expiry_buffer(),
        })
    }

    pub async fn access_token(&self) -> Result<Option<SecretString>, TokenError> {
        Ok(self
            .store
            .get(&StorageKey::access_token())
            .await?
            .map(SecretString::new))
    }

    /// Expiry of the stored access token.
    pub async fn expires_at(&self) -> Result<UnixTimeMs, TokenError> {
        let token = self
            .access_token()
            .await?
            .ok_or(TokenError::MissingAccessToken)?;
        decode_expiry(token.expose_secret())
    }

    /// `true` when the access token expires within the buffer, or cannot be
    /// read or decoded.
    pub async fn is_expiring_soon(&self) -> bool {
        match self.expires_at().await {
            Ok(expiry) => {
                let now = UnixTimeMs::now();
                expiry < now.saturating_add(self.expiry_buffer)
            }
            Err(TokenError::MissingAccessToken) => true,
            Err(e) => {
                warn!("cannot check token expiry, treating as expiring: {}", e);
                true
            }
        }
    }

    /// Whole seconds until the access token expires; zero when missing,
    /// undecodable or already expired.
    pub async fn remaining_lifetime_secs(&self) -> u64 {
        match self.expires_at().await {
            Ok(expiry) => expiry.saturating_duration_since(UnixTimeMs::now()).as_secs(),
            Err(_) => 0,
        }
    }

    /// Refreshes when the access token is expiring. Returns whether a usable
    /// token is available afterwards; no network call when it is not expiring.
    #[instrument(skip(self))]
    pub async fn refresh_if_needed(&self) -> bool {
        if !self.is_expiring_soon().await {
            return true;
        }
        info!("access token expiring soon, refreshing");
        match self.refresh().await {
            Ok(_) => true,
            Err(e) => {
                warn!(requires_login = e.requires_login(), "token refresh failed: {}", e);
                false
            }
        }
    }

    /// Exchanges the refresh token for a new access token and persists it.
    /// Nothing is written unless the exchange succeeds.
    pub async fn refresh(&self) -> Result<SecretString, TokenError> {
        let refresh = self
            .store
            .get(&StorageKey::refresh_token())
            .await?
            .map(SecretString::new)
            .ok_or(TokenError::MissingRefreshToken)?;

        let request = HttpRequest::new(HttpMethod::Post, self.refresh_url.clone())
            .with_json(&serde_json::json!({ "refresh": refresh.expose_secret() }))?;
        let request_id = request.request_id().to_string();

        let response = self
            .transport
            .send(request)
            .await?
            .error_for_status(&request_id)?;
        let body: RefreshResponse = response.json(&request_id)?;
        let access = body
            .access
            .filter(|a| !a.is_empty())
            .ok_or(TokenError::MissingAccessInResponse)?;

        self.store
            .set(&StorageKey::access_token(), access.clone())
            .await?;
        info!("access token refreshed");
        Ok(SecretString::new(access))
    }

    /// Adds `Authorization: Bearer <access>` when a non-expired access token
    /// is stored. Otherwise the request is returned unchanged.
    pub async fn authorize(&self, request: HttpRequest) -> HttpRequest {
        let token = match self.access_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return request,
            Err(e) => {
                warn!("cannot read access token: {}", e);
                return request;
            }
        };
        match decode_expiry(token.expose_secret()) {
            Ok(expiry) if expiry > UnixTimeMs::now() => {}
            Ok(_) => {
                debug!("access token expired, sending without credentials");
                return request;
            }
            Err(e) => {
                warn!("stored access token is malformed: {}", e);
                return request;
            }
        }
        let header = format!("Bearer {}", token.expose_secret());
        match request.clone().with_header("Authorization", header) {
            Ok(authorized) => authorized,
            Err(e) => {
                warn!("cannot attach access token: {}", e);
                request
            }
        }
    }

    pub async fn store_credentials(&self, credentials: &Credentials) -> Result<(), TokenError> {
        self.store
            .set(
                &StorageKey::access_token(),
                credentials.access.expose_secret().clone(),
            )
            .await?;
        self.store
            .set(
                &StorageKey::refresh_token(),
                credentials.refresh.expose_secret().clone(),
            )
            .await?;
        Ok(())
    }

    pub async fn clear_credentials(&self) -> Result<(), TokenError> {
        self.store.remove(&StorageKey::access_token()).await?;
        self.store.remove(&StorageKey::refresh_token()).await?;
        info!("credentials cleared");
        Ok(())
    }
}
