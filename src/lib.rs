//! billflow - billing orchestration over a payments provider and a
//! card/expense ledger
//!
//! billflow owns the decision logic that sits between the two vendors:
//!
//! - **Subscriptions**: lifecycle state machine, trials, pauses, plan and
//!   quantity changes with proration
//! - **Reconciliation**: end-of-period invoicing, MRR/ARR/churn, credits,
//!   payment retry
//! - **Webhooks**: signature verification and idempotent, at-least-once
//!   event processing
//! - **Ledger sync**: cursor-paginated import with retry and linear backoff
//! - **HTTP**: axum routes for webhook intake and the billing API
//! - **Testing**: in-memory doubles and Alba-style endpoint testing
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use billflow::billing::InMemoryBillingStore;
//! use billflow::http::{self, AppState};
//! use billflow::testing::MockPaymentGateway;
//! use billflow::ConfigBuilder;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     billflow::init_tracing();
//!
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     let state = AppState::new(
//!         InMemoryBillingStore::new(),
//!         MockPaymentGateway::new(),
//!         &config.webhooks,
//!     )
//!     .with_max_body_size(config.server.max_body_size);
//!
//!     http::serve(http::router(state), &config.server).await?;
//!     Ok(())
//! }
//! ```

pub mod billing;
mod config;
mod error;
pub mod http;
pub mod ledger;
pub mod sync;
pub mod testing;
mod utils;
pub mod webhooks;

// Re-exports for public API
pub use config::{
    Config, ConfigBuilder, LedgerConfig, LoggingConfig, ServerConfig, SyncConfig, WebhookConfig,
};
pub use error::{BillflowError, ErrorBody, GatewayKind, Result};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "billflow::sync=debug")
/// - `BILLFLOW_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("BILLFLOW_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    install(env_filter, json_logs);
}

/// Initialize tracing from a [`LoggingConfig`]
pub fn init_tracing_with_config(config: &LoggingConfig) {
    install(EnvFilter::new(&config.level), config.json);
}

fn install(env_filter: EnvFilter, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
