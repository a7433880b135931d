//! Cursor-driven ledger sync.
//!
//! Each resource is paged strictly in order: a page is fully processed
//! before the next is requested. Per-item failures are collected as
//! [`SyncError`]s; a page fetch that fails (after retries, for
//! transactions) aborts that resource's sync.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::error::{BillflowError, GatewayKind, Result};
use crate::ledger::{Bill, LedgerGateway, LedgerTransaction, Page, PageRequest, Reimbursement};
use super::sink::LedgerSink;
use super::{FullSyncResult, SyncError, SyncResource, SyncResult, SyncWindow};

const TARGET: &str = "billflow::sync";

/// A ledger resource the engine knows how to page and store.
#[async_trait]
trait SyncItem: Sized + Send + Sync + 'static {
    const RESOURCE: SyncResource;
    /// Whether page fetches for this resource are retried.
    const RETRY_FETCH: bool;

    fn id(&self) -> &str;
    fn check(&self) -> std::result::Result<(), String>;
    async fn fetch<L: LedgerGateway>(ledger: &L, request: &PageRequest) -> Result<Page<Self>>;
    async fn store<K: LedgerSink>(&self, sink: &K, business_id: &str) -> Result<()>;
}

#[async_trait]
impl SyncItem for LedgerTransaction {
    const RESOURCE: SyncResource = SyncResource::Transaction;
    const RETRY_FETCH: bool = true;

    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self) -> std::result::Result<(), String> {
        self.validate()
    }

    async fn fetch<L: LedgerGateway>(ledger: &L, request: &PageRequest) -> Result<Page<Self>> {
        ledger.list_transactions(request).await
    }

    async fn store<K: LedgerSink>(&self, sink: &K, business_id: &str) -> Result<()> {
        sink.upsert_transaction(business_id, self).await
    }
}

#[async_trait]
impl SyncItem for Bill {
    const RESOURCE: SyncResource = SyncResource::Bill;
    const RETRY_FETCH: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self) -> std::result::Result<(), String> {
        self.validate()
    }

    async fn fetch<L: LedgerGateway>(ledger: &L, request: &PageRequest) -> Result<Page<Self>> {
        ledger.list_bills(request).await
    }

    async fn store<K: LedgerSink>(&self, sink: &K, business_id: &str) -> Result<()> {
        sink.upsert_bill(business_id, self).await
    }
}

#[async_trait]
impl SyncItem for Reimbursement {
    const RESOURCE: SyncResource = SyncResource::Reimbursement;
    const RETRY_FETCH: bool = false;

    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self) -> std::result::Result<(), String> {
        self.validate()
    }

    async fn fetch<L: LedgerGateway>(ledger: &L, request: &PageRequest) -> Result<Page<Self>> {
        ledger.list_reimbursements(request).await
    }

    async fn store<K: LedgerSink>(&self, sink: &K, business_id: &str) -> Result<()> {
        sink.upsert_reimbursement(business_id, self).await
    }
}

/// Pages ledger resources into a [`LedgerSink`].
pub struct SyncEngine<L: LedgerGateway, K: LedgerSink> {
    ledger: L,
    sink: K,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl<L: LedgerGateway, K: LedgerSink> SyncEngine<L, K> {
    #[must_use]
    pub fn new(ledger: L, sink: K, config: SyncConfig) -> Self {
        Self {
            ledger,
            sink,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops the engine before its next page fetch.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn sync_transactions(&self, window: &SyncWindow) -> Result<SyncResult> {
        self.sync_resource::<LedgerTransaction>(window).await
    }

    pub async fn sync_bills(&self, window: &SyncWindow) -> Result<SyncResult> {
        self.sync_resource::<Bill>(window).await
    }

    pub async fn sync_reimbursements(&self, window: &SyncWindow) -> Result<SyncResult> {
        self.sync_resource::<Reimbursement>(window).await
    }

    /// Transactions, then bills, then reimbursements.
    ///
    /// The first fatal page-fetch failure is returned as an error; item
    /// errors from all three resources are merged.
    pub async fn full_sync(&self, window: &SyncWindow) -> Result<FullSyncResult> {
        window.validate()?;

        tracing::info!(
            target: TARGET,
            business_id = %window.business_id,
            from = ?window.from,
            to = ?window.to,
            "Starting full ledger sync"
        );

        let transactions = self.sync_transactions(window).await?;
        let bills = self.sync_bills(window).await?;
        let reimbursements = self.sync_reimbursements(window).await?;

        let result = FullSyncResult::merge(transactions, bills, reimbursements);
        tracing::info!(
            target: TARGET,
            business_id = %window.business_id,
            transactions = result.transactions,
            bills = result.bills,
            reimbursements = result.reimbursements,
            errors = result.errors.len(),
            "Full ledger sync finished"
        );
        Ok(result)
    }

    /// `full_sync` over `[since, now)`.
    pub async fn incremental_sync(&self, business_id: &str, since: DateTime<Utc>) -> Result<FullSyncResult> {
        self.incremental_sync_at(business_id, since, Utc::now()).await
    }

    pub async fn incremental_sync_at(
        &self,
        business_id: &str,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FullSyncResult> {
        if since >= now {
            return Err(BillflowError::invalid_input(format!(
                "Incremental sync start {} is not before {}",
                since.to_rfc3339(),
                now.to_rfc3339()
            )));
        }
        self.full_sync(&SyncWindow::between(business_id, since, now)).await
    }

    async fn sync_resource<T: SyncItem>(&self, window: &SyncWindow) -> Result<SyncResult> {
        window.validate()?;

        let resource = T::RESOURCE;
        let mut result = SyncResult::new(resource);
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            self.ensure_not_cancelled()?;

            let request = PageRequest::first(self.config.page_size)
                .with_cursor(cursor.clone())
                .with_window(window.from, window.to);
            let page = self.fetch_page::<T>(&request).await?;
            pages += 1;

            for item in &page.data {
                match self.process_item(item, &window.business_id).await {
                    Ok(()) => result.synced += 1,
                    Err(message) => {
                        tracing::warn!(
                            target: TARGET,
                            resource = resource.as_str(),
                            id = item.id(),
                            error = %message,
                            "Skipping ledger record"
                        );
                        result.errors.push(SyncError::new(resource, item.id(), message));
                    }
                }
            }

            match page.next_cursor() {
                Some(next) if cursor.as_deref() == Some(next) => {
                    return Err(BillflowError::gateway(
                        GatewayKind::Ledger,
                        format!("list_{}", resource.as_str()),
                        format!("pagination cursor '{}' did not advance", next),
                    ));
                }
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }

        result.success = result.errors.is_empty();
        tracing::info!(
            target: TARGET,
            resource = resource.as_str(),
            business_id = %window.business_id,
            pages,
            synced = result.synced,
            errors = result.errors.len(),
            "Resource sync finished"
        );
        Ok(result)
    }

    async fn process_item<T: SyncItem>(&self, item: &T, business_id: &str) -> std::result::Result<(), String> {
        item.check()?;
        item.store(&self.sink, business_id).await.map_err(|e| e.to_string())
    }

    /// Fetch one page; transactions retry with linear backoff
    /// (`base_delay_ms * attempt`).
    async fn fetch_page<T: SyncItem>(&self, request: &PageRequest) -> Result<Page<T>> {
        let max_attempts = if T::RETRY_FETCH {
            self.config.max_attempts.max(1)
        } else {
            1
        };
        let mut attempt = 1;

        loop {
            match T::fetch(&self.ledger, request).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < max_attempts => {
                    let delay_ms = self.config.base_delay_ms.saturating_mul(u64::from(attempt));
                    tracing::warn!(
                        target: TARGET,
                        resource = T::RESOURCE.as_str(),
                        cursor = ?request.start_cursor,
                        attempt,
                        delay_ms,
                        error = %e,
                        "Page fetch failed, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(cancelled()),
                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        target: TARGET,
                        resource = T::RESOURCE.as_str(),
                        cursor = ?request.start_cursor,
                        attempt,
                        error = %e,
                        "Page fetch failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    fn ensure_not_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!(target: TARGET, "Sync cancelled");
            return Err(cancelled());
        }
        Ok(())
    }
}

fn cancelled() -> BillflowError {
    BillflowError::invalid_state("sync cancelled")
}
