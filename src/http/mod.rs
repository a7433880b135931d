//! HTTP surface: webhook intake plus the collaborator-facing billing API.
//!
//! Responses use the `{success, data}` envelope; errors render as
//! `{success: false, error: {code, message}}` via [`crate::BillflowError`].
//!
//! # Example
//!
//! ```rust,ignore
//! use billflow::http::{self, AppState};
//!
//! let state = AppState::new(store, gateway, &config.webhooks)
//!     .with_max_body_size(config.server.max_body_size);
//! http::serve(http::router(state), &config.server).await?;
//! ```

pub mod billing;
pub mod query;
pub mod response;
pub mod routes;
mod server;
pub mod state;
pub mod subscriptions;
pub mod webhooks;

pub use query::{CurrencyQuery, PaginationQuery, Query};
pub use response::{ApiResponse, CreatedResponse, JsonResponse, PaginationMeta};
pub use routes::{RouteModule, router};
pub use server::serve;
pub use state::AppState;
pub use webhooks::{RAMP_SIGNATURE_HEADER, STRIPE_SIGNATURE_HEADER};
