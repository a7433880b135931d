//! Card/expense ledger gateway: resource types, the collaborator trait,
//! OAuth2 token caching, the live HTTP client and webhook intake.

pub mod gateway;
pub mod live_client;
pub mod token;
pub mod types;
pub mod webhook;

pub use gateway::{LedgerGateway, MAX_PAGE_SIZE, Page, PageInfo, PageRequest};
pub use live_client::LiveLedgerClient;
pub use token::{ClientCredentialsFetcher, IssuedToken, TokenCache, TokenFetcher};
pub use types::{
    Bill, Business, Card, CardProgram, Department, LedgerAmount, LedgerTransaction, Location,
    Reimbursement, SpendProgram, User, Vendor,
};
pub use webhook::{
    LedgerEventCategory, LedgerEventHandler, LedgerWebhookEvent, LedgerWebhookOutcome,
    LedgerWebhookProcessor,
};
