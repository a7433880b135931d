//! Destination for synced ledger records.

use async_trait::async_trait;

use crate::error::Result;
use crate::ledger::{Bill, LedgerTransaction, Reimbursement};

/// Where synced ledger records are written. Upserts are keyed on the ledger
/// id, so re-syncing a window is harmless.
#[async_trait]
pub trait LedgerSink: Send + Sync {
    async fn upsert_transaction(&self, business_id: &str, transaction: &LedgerTransaction) -> Result<()>;
    async fn upsert_bill(&self, business_id: &str, bill: &Bill) -> Result<()>;
    async fn upsert_reimbursement(&self, business_id: &str, reimbursement: &Reimbursement) -> Result<()>;
}

pub mod memory {
    //! In-memory sink for tests and local runs.

    use super::*;
    use crate::error::BillflowError;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct Records {
        transactions: BTreeMap<String, LedgerTransaction>,
        bills: BTreeMap<String, Bill>,
        reimbursements: BTreeMap<String, Reimbursement>,
        failing_ids: HashSet<String>,
    }

    /// In-memory [`LedgerSink`].
    #[derive(Clone, Default)]
    pub struct InMemoryLedgerSink {
        inner: Arc<RwLock<Records>>,
    }

    impl InMemoryLedgerSink {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every upsert of this record id fail (for testing).
        pub async fn fail_on(&self, id: impl Into<String>) {
            self.inner.write().await.failing_ids.insert(id.into());
        }

        pub async fn transactions(&self) -> Vec<LedgerTransaction> {
            self.inner.read().await.transactions.values().cloned().collect()
        }

        pub async fn bills(&self) -> Vec<Bill> {
            self.inner.read().await.bills.values().cloned().collect()
        }

        pub async fn reimbursements(&self) -> Vec<Reimbursement> {
            self.inner.read().await.reimbursements.values().cloned().collect()
        }
    }

    fn check(records: &Records, id: &str) -> Result<()> {
        if records.failing_ids.contains(id) {
            return Err(BillflowError::internal(format!("sink rejected record '{}'", id)));
        }
        Ok(())
    }

    #[async_trait]
    impl LedgerSink for InMemoryLedgerSink {
        async fn upsert_transaction(&self, _business_id: &str, transaction: &LedgerTransaction) -> Result<()> {
            let mut records = self.inner.write().await;
            check(&records, &transaction.id)?;
            records.transactions.insert(transaction.id.clone(), transaction.clone());
            Ok(())
        }

        async fn upsert_bill(&self, _business_id: &str, bill: &Bill) -> Result<()> {
            let mut records = self.inner.write().await;
            check(&records, &bill.id)?;
            records.bills.insert(bill.id.clone(), bill.clone());
            Ok(())
        }

        async fn upsert_reimbursement(&self, _business_id: &str, reimbursement: &Reimbursement) -> Result<()> {
            let mut records = self.inner.write().await;
            check(&records, &reimbursement.id)?;
            records
                .reimbursements
                .insert(reimbursement.id.clone(), reimbursement.clone());
            Ok(())
        }
    }
}
