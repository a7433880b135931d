use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for storing processed webhook event IDs to prevent duplicate processing
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Check if an event has already been processed
    async fn is_processed(&self, event_id: &str) -> Result<bool>;

    /// Mark an event as processed
    async fn mark_processed(&self, event_id: String) -> Result<()>;

    /// Clean up entries older than `max_age`; returns how many were removed
    async fn cleanup_old_entries(&self, _max_age: Duration) -> Result<usize> {
        Ok(0)
    }
}

/// In-memory idempotency store
///
/// Entries live for the lifetime of the process. Production deployments keep
/// processed ids in the billing database via `EventStore`.
#[derive(Clone, Default)]
pub struct MemoryIdempotencyStore {
    processed: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of remembered events.
    pub async fn len(&self) -> usize {
        self.processed.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.processed.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn is_processed(&self, event_id: &str) -> Result<bool> {
        let processed = self.processed.read().await;
        Ok(processed.contains_key(event_id))
    }

    async fn mark_processed(&self, event_id: String) -> Result<()> {
        let mut processed = self.processed.write().await;
        processed.entry(event_id).or_insert_with(Utc::now);
        Ok(())
    }

    async fn cleanup_old_entries(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - max_age;
        let mut processed = self.processed.write().await;
        let before = processed.len();
        processed.retain(|_, at| *at >= cutoff);
        Ok(before - processed.len())
    }
}
