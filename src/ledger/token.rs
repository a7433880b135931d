//! OAuth2 client-credentials tokens for the ledger API.
//!
//! Tokens are cached and refreshed shortly before they expire. The cache
//! holds an async mutex across the fetch so concurrent callers share one
//! refresh.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::config::LedgerConfig;
use crate::error::{BillflowError, GatewayKind, Result};

const TARGET: &str = "billflow::ledger";

/// Refresh this long before the token's reported expiry.
pub const REFRESH_MARGIN_SECONDS: i64 = 60;

/// A token as issued by the authorization server.
pub struct IssuedToken {
    pub access_token: SecretString,
    pub expires_in: i64,
}

/// Source of fresh access tokens.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch_token(&self) -> Result<IssuedToken>;
}

struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

/// Caches an access token and refreshes it 60 seconds before expiry.
pub struct TokenCache<F: TokenFetcher> {
    fetcher: F,
    cached: Mutex<Option<CachedToken>>,
}

impl<F: TokenFetcher> TokenCache<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            cached: Mutex::new(None),
        }
    }

    /// Current token, fetching a new one if needed.
    pub async fn get_token(&self) -> Result<SecretString> {
        self.get_token_at(Utc::now()).await
    }

    pub async fn get_token_at(&self, now: DateTime<Utc>) -> Result<SecretString> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if now < token.expires_at - Duration::seconds(REFRESH_MARGIN_SECONDS) {
                return Ok(token.value.clone());
            }
        }

        let issued = self.fetcher.fetch_token().await?;
        let expires_at = now + Duration::seconds(issued.expires_in.max(0));
        tracing::debug!(
            target: TARGET,
            expires_in = issued.expires_in,
            "Fetched ledger access token"
        );

        let value = issued.access_token.clone();
        *cached = Some(CachedToken {
            value: issued.access_token,
            expires_at,
        });
        Ok(value)
    }

    /// Drop the cached token, e.g. after the API rejected it.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Fetches tokens with the OAuth2 client-credentials grant.
pub struct ClientCredentialsFetcher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    scope: String,
}

impl ClientCredentialsFetcher {
    pub fn new(http: reqwest::Client, config: &LedgerConfig) -> Self {
        Self {
            http,
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
        }
    }
}

impl std::fmt::Debug for ClientCredentialsFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCredentialsFetcher")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenFetcher for ClientCredentialsFetcher {
    async fn fetch_token(&self) -> Result<IssuedToken> {
        let body = format!(
            "grant_type=client_credentials&scope={}",
            urlencoding::encode(&self.scope)
        );

        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| BillflowError::gateway_source(GatewayKind::Ledger, "fetch_token", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BillflowError::gateway(
                GatewayKind::Ledger,
                "fetch_token",
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| BillflowError::gateway_source(GatewayKind::Ledger, "fetch_token", e))?;

        Ok(IssuedToken {
            access_token: SecretString::from(token.access_token),
            expires_in: token.expires_in,
        })
    }
}
