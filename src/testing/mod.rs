//! Testing utilities for billflow
//!
//! - Alba-style HTTP endpoint testing without running a server
//! - Scriptable doubles for the payment and ledger gateways
//! - Record fixtures
//!
//! # Example
//!
//! ```rust,ignore
//! use billflow::http::{AppState, router};
//! use billflow::testing::{self, MockLedgerGateway, MockPaymentGateway};
//!
//! #[tokio::test]
//! async fn test_overview() {
//!     let app = router(state);
//!
//!     testing::get(app, "/billing/overview?currency=usd")
//!         .execute()
//!         .await
//!         .assert_success();
//! }
//! ```

mod fixtures;
mod ledger_gateway;
mod payment_gateway;
mod scenario;

pub use fixtures::{bill, customer, fake, monthly_plan, reimbursement, transaction};
pub use ledger_gateway::MockLedgerGateway;
pub use payment_gateway::MockPaymentGateway;
pub use scenario::{Scenario, ScenarioAssert, get, post};
