//! Live ledger API client.
//!
//! Bearer-authenticated JSON over `reqwest`, with tokens from a
//! [`TokenCache`]. Retrying is left to callers (the sync engine retries page
//! fetches); this client only enforces the request timeout.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LedgerConfig;
use crate::error::{BillflowError, GatewayKind, Result};
use super::gateway::{LedgerGateway, Page, PageRequest};
use super::token::{ClientCredentialsFetcher, TokenCache, TokenFetcher};
use super::types::{
    Bill, Business, Card, CardProgram, Department, LedgerTransaction, Location, Reimbursement,
    SpendProgram, User, Vendor,
};

const TARGET: &str = "billflow::ledger";

/// Ledger API client.
pub struct LiveLedgerClient<F: TokenFetcher = ClientCredentialsFetcher> {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenCache<F>>,
}

impl LiveLedgerClient<ClientCredentialsFetcher> {
    /// Build a client from configuration.
    pub fn from_config(config: &LedgerConfig) -> Result<Self> {
        if config.client_id.is_empty() || config.client_secret.expose_secret().is_empty() {
            return Err(BillflowError::invalid_input(
                "RAMP_CLIENT_ID and RAMP_CLIENT_SECRET must be set",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| BillflowError::gateway_source(GatewayKind::Ledger, "build_client", e))?;

        let fetcher = ClientCredentialsFetcher::new(http.clone(), config);
        Ok(Self::with_token_cache(
            http,
            config.base_url.clone(),
            Arc::new(TokenCache::new(fetcher)),
        ))
    }
}

impl<F: TokenFetcher> LiveLedgerClient<F> {
    pub fn with_token_cache(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<TokenCache<F>>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str, query: &[(&'static str, String)]) -> String {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        for (i, (key, value)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&'static str, String)],
    ) -> Result<T> {
        let token = self.tokens.get_token().await?;
        let url = self.url(path, query);

        tracing::debug!(target: TARGET, operation, path, "Ledger API request");

        let response = self
            .http
            .get(&url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| BillflowError::gateway_source(GatewayKind::Ledger, operation, e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                target: TARGET,
                operation,
                status = status.as_u16(),
                "Ledger API request failed"
            );
            return Err(BillflowError::gateway(
                GatewayKind::Ledger,
                operation,
                format!("HTTP {}: {}", status.as_u16(), body),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BillflowError::gateway_source(GatewayKind::Ledger, operation, e))
    }

    async fn list<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        request: &PageRequest,
    ) -> Result<Page<T>> {
        self.get_json(operation, path, &request.query_pairs()).await
    }
}

impl<F: TokenFetcher> std::fmt::Debug for LiveLedgerClient<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveLedgerClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F: TokenFetcher + 'static> LedgerGateway for LiveLedgerClient<F> {
    async fn get_business(&self) -> Result<Business> {
        self.get_json("get_business", "business", &[]).await
    }

    async fn list_users(&self, request: &PageRequest) -> Result<Page<User>> {
        self.list("list_users", "users", request).await
    }

    async fn get_user(&self, user_id: &str) -> Result<User> {
        let path = format!("users/{}", urlencoding::encode(user_id));
        self.get_json("get_user", &path, &[]).await
    }

    async fn list_cards(&self, request: &PageRequest) -> Result<Page<Card>> {
        self.list("list_cards", "cards", request).await
    }

    async fn get_card(&self, card_id: &str) -> Result<Card> {
        let path = format!("cards/{}", urlencoding::encode(card_id));
        self.get_json("get_card", &path, &[]).await
    }

    async fn list_transactions(&self, request: &PageRequest) -> Result<Page<LedgerTransaction>> {
        self.list("list_transactions", "transactions", request).await
    }

    async fn get_transaction(&self, transaction_id: &str) -> Result<LedgerTransaction> {
        let path = format!("transactions/{}", urlencoding::encode(transaction_id));
        self.get_json("get_transaction", &path, &[]).await
    }

    async fn list_reimbursements(&self, request: &PageRequest) -> Result<Page<Reimbursement>> {
        self.list("list_reimbursements", "reimbursements", request).await
    }

    async fn list_bills(&self, request: &PageRequest) -> Result<Page<Bill>> {
        self.list("list_bills", "bills", request).await
    }

    async fn list_vendors(&self, request: &PageRequest) -> Result<Page<Vendor>> {
        self.list("list_vendors", "vendors", request).await
    }

    async fn list_departments(&self, request: &PageRequest) -> Result<Page<Department>> {
        self.list("list_departments", "departments", request).await
    }

    async fn list_locations(&self, request: &PageRequest) -> Result<Page<Location>> {
        self.list("list_locations", "locations", request).await
    }

    async fn list_card_programs(&self, request: &PageRequest) -> Result<Page<CardProgram>> {
        self.list("list_card_programs", "card-programs", request).await
    }

    async fn list_spend_programs(&self, request: &PageRequest) -> Result<Page<SpendProgram>> {
        self.list("list_spend_programs", "spend-programs", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::token::IssuedToken;
    use secrecy::SecretString;

    struct StaticFetcher;

    #[async_trait]
    impl TokenFetcher for StaticFetcher {
        async fn fetch_token(&self) -> Result<IssuedToken> {
            Ok(IssuedToken {
                access_token: SecretString::from("tok".to_string()),
                expires_in: 3600,
            })
        }
    }

    fn client() -> LiveLedgerClient<StaticFetcher> {
        LiveLedgerClient::with_token_cache(
            reqwest::Client::new(),
            "https://ledger.example.com/v1/",
            Arc::new(TokenCache::new(StaticFetcher)),
        )
    }

    #[test]
    fn test_url_building_encodes_query() {
        let client = client();
        let request = PageRequest::first(25).with_cursor(Some("a b&c".to_string()));
        assert_eq!(
            client.url("transactions", &request.query_pairs()),
            "https://ledger.example.com/v1/transactions?start=a%20b%26c&page_size=25"
        );
        assert_eq!(client.url("/business", &[]), "https://ledger.example.com/v1/business");
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let err = LiveLedgerClient::from_config(&LedgerConfig::default()).unwrap_err();
        assert!(matches!(err, BillflowError::InvalidInput(_)));
    }

    #[test]
    fn test_debug_hides_tokens() {
        let debug = format!("{:?}", client());
        assert!(debug.contains("ledger.example.com"));
        assert!(!debug.contains("tok\""));
    }
}
