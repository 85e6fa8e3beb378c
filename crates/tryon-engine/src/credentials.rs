//! Short-lived bearer tokens for providers that authenticate with a service
//! account.
//!
//! Tokens are cached per provider until five minutes before they expire.
//! Callers that miss the cache at the same time share one exchange, and a
//! failed exchange is handed to every waiter of that round but never cached.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::AuthError;

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
pub const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub provider: String,
    pub token: String,
    pub expires_at: Instant,
}

impl Credential {
    pub fn is_fresh(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Protocol seam between the broker and a token endpoint.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self) -> Result<ExchangedToken, AuthError>;
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .field("project_id", &self.project_id)
            .finish()
    }
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_json(raw: &str) -> Result<Self, AuthError> {
        let key: Self =
            serde_json::from_str(raw).map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        if key.client_email.trim().is_empty() || key.private_key.trim().is_empty() {
            return Err(AuthError::InvalidKey(
                "client_email and private_key are required".to_string(),
            ));
        }
        Ok(key)
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AuthError::InvalidKey(format!("failed reading {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
    pub scope: String,
}

/// OAuth2 JWT-bearer exchange for a Google-style service account key.
#[derive(Debug, Clone)]
pub struct ServiceAccountExchange {
    key: ServiceAccountKey,
    scope: String,
    http: HttpClient,
}

impl ServiceAccountExchange {
    pub fn new(key: ServiceAccountKey, scope: impl Into<String>) -> Self {
        Self {
            key,
            scope: scope.into(),
            http: HttpClient::new(),
        }
    }

    pub fn key(&self) -> &ServiceAccountKey {
        &self.key
    }

    pub fn signed_assertion(&self, issued_at: i64) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        let claims = AssertionClaims {
            iss: self.key.client_email.clone(),
            sub: self.key.client_email.clone(),
            aud: self.key.token_uri.clone(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
            scope: self.scope.clone(),
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| AuthError::InvalidKey(err.to_string()))?;
        jsonwebtoken::encode(&header, &claims, &encoding_key)
            .map_err(|err| AuthError::InvalidKey(err.to_string()))
    }
}

#[async_trait]
impl TokenExchange for ServiceAccountExchange {
    async fn exchange(&self) -> Result<ExchangedToken, AuthError> {
        let assertion = self.signed_assertion(chrono::Utc::now().timestamp())?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body: crate::truncate_text(&body, 512),
            });
        }
        let payload: Value =
            serde_json::from_str(&body).map_err(|err| AuthError::Malformed(err.to_string()))?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AuthError::Malformed("missing access_token".to_string()))?;
        let expires_in = payload
            .get("expires_in")
            .and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|raw| raw.trim().parse::<u64>().ok()))
            })
            .unwrap_or(ASSERTION_LIFETIME_SECS as u64);
        Ok(ExchangedToken {
            access_token: access_token.to_string(),
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

struct TokenSlot {
    provider: String,
    exchange: Arc<dyn TokenExchange>,
    cached: RwLock<Option<Credential>>,
    inflight: Mutex<Option<SharedRefresh>>,
}

impl TokenSlot {
    fn fresh(&self, margin: Duration) -> Option<Credential> {
        self.cached
            .read()
            .ok()?
            .as_ref()
            .filter(|credential| credential.is_fresh(margin))
            .cloned()
    }

    fn store(&self, credential: Option<Credential>) {
        if let Ok(mut cached) = self.cached.write() {
            *cached = credential;
        }
    }

    async fn refresh(self: Arc<Self>) -> Result<Credential, AuthError> {
        debug!(provider = %self.provider, "exchanging service account assertion");
        let result = self.exchange.exchange().await.map(|token| Credential {
            provider: self.provider.clone(),
            token: token.access_token,
            expires_at: Instant::now() + token.expires_in,
        });
        match &result {
            Ok(credential) => {
                info!(
                    provider = %self.provider,
                    ttl_secs = credential.expires_at.saturating_duration_since(Instant::now()).as_secs(),
                    "token refreshed"
                );
                self.store(Some(credential.clone()));
            }
            Err(err) => warn!(provider = %self.provider, error = %err, "token exchange failed"),
        }
        *self.inflight.lock().await = None;
        result
    }
}

#[derive(Default)]
pub struct CredentialBroker {
    slots: HashMap<String, Arc<TokenSlot>>,
    refresh_margin: Option<Duration>,
}

impl CredentialBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = Some(margin);
        self
    }

    pub fn register(&mut self, provider: &str, exchange: Arc<dyn TokenExchange>) {
        self.slots.insert(
            provider.to_string(),
            Arc::new(TokenSlot {
                provider: provider.to_string(),
                exchange,
                cached: RwLock::new(None),
                inflight: Mutex::new(None),
            }),
        );
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.slots.contains_key(provider)
    }

    fn margin(&self) -> Duration {
        self.refresh_margin.unwrap_or(REFRESH_MARGIN)
    }

    pub async fn get_token(&self, provider: &str) -> Result<Credential, AuthError> {
        let slot = self
            .slots
            .get(provider)
            .ok_or_else(|| AuthError::NotConfigured(provider.to_string()))?;
        let margin = self.margin();
        if let Some(credential) = slot.fresh(margin) {
            return Ok(credential);
        }

        let refresh = {
            let mut inflight = slot.inflight.lock().await;
            // Another caller may have finished a refresh while we waited.
            if let Some(credential) = slot.fresh(margin) {
                return Ok(credential);
            }
            match inflight.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let started = slot.clone().refresh().boxed().shared();
                    *inflight = Some(started.clone());
                    started
                }
            }
        };
        refresh.await
    }

    /// Drops the cached token so the next caller exchanges again.
    pub fn invalidate(&self, provider: &str) {
        if let Some(slot) = self.slots.get(provider) {
            slot.store(None);
        }
    }
}
