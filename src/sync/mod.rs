//! Paginated ledger sync.
//!
//! # Example
//!
//! ```rust,ignore
//! use billflow::sync::{SyncEngine, SyncWindow};
//!
//! let engine = SyncEngine::new(ledger, sink, config.sync.clone());
//! let result = engine.incremental_sync("biz_123", last_run).await?;
//! if !result.success {
//!     for error in &result.errors {
//!         tracing::warn!(resource = error.resource.as_str(), id = %error.id, "{}", error.message);
//!     }
//! }
//! ```

pub mod engine;
pub mod sink;

pub use engine::SyncEngine;
pub use sink::LedgerSink;
pub use sink::memory::InMemoryLedgerSink;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{BillflowError, Result};

/// Resource types the engine syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResource {
    Transaction,
    Bill,
    Reimbursement,
}

impl SyncResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transaction => "transactions",
            Self::Bill => "bills",
            Self::Reimbursement => "reimbursements",
        }
    }
}

/// A single record that could not be synced. Collected, never thrown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncError {
    pub resource: SyncResource,
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SyncError {
    pub fn new(resource: SyncResource, id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource,
            id: id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of syncing one resource type.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub resource: SyncResource,
    pub synced: usize,
    pub errors: Vec<SyncError>,
    pub success: bool,
}

impl SyncResult {
    pub fn new(resource: SyncResource) -> Self {
        Self {
            resource,
            synced: 0,
            errors: Vec::new(),
            success: true,
        }
    }
}

/// Outcome of a full sync across all three resource types.
#[derive(Debug, Clone, Serialize)]
pub struct FullSyncResult {
    pub transactions: usize,
    pub bills: usize,
    pub reimbursements: usize,
    pub errors: Vec<SyncError>,
    /// True when no record failed.
    pub success: bool,
}

impl FullSyncResult {
    pub fn merge(transactions: SyncResult, bills: SyncResult, reimbursements: SyncResult) -> Self {
        let mut errors = transactions.errors;
        errors.extend(bills.errors);
        errors.extend(reimbursements.errors);
        Self {
            transactions: transactions.synced,
            bills: bills.synced,
            reimbursements: reimbursements.synced,
            success: errors.is_empty(),
            errors,
        }
    }
}

/// Which business and time range to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncWindow {
    pub business_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl SyncWindow {
    /// Everything the ledger holds for the business.
    pub fn all(business_id: impl Into<String>) -> Self {
        Self {
            business_id: business_id.into(),
            from: None,
            to: None,
        }
    }

    /// `[from, to)`.
    pub fn between(business_id: impl Into<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            business_id: business_id.into(),
            from: Some(from),
            to: Some(to),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.business_id.trim().is_empty() {
            return Err(BillflowError::invalid_input("business_id is required"));
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from >= to {
                return Err(BillflowError::invalid_input("sync window start must precede its end"));
            }
        }
        Ok(())
    }
}
