use crate::error::{BillflowError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::IdempotencyStore;

/// Trait representing a webhook event
pub trait WebhookEvent: DeserializeOwned + Send + Sync {
    /// Get the unique event ID for idempotency checking
    fn event_id(&self) -> &str;

    /// Get the event type/name
    fn event_type(&self) -> &str;
}

/// Trait for handling webhook events
///
/// # Example
///
/// ```rust,ignore
/// use billflow::webhooks::{WebhookEvent, WebhookHandler};
///
/// struct CardEventHandler;
///
/// #[async_trait]
/// impl WebhookHandler<LedgerWebhookEvent> for CardEventHandler {
///     type Output = ();
///
///     async fn handle(&self, event: &LedgerWebhookEvent) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait WebhookHandler<E: WebhookEvent>: Send + Sync {
    /// What a successful handling reports back to the caller.
    type Output: Send;

    /// Handle the webhook event
    async fn handle(&self, event: &E) -> Result<Self::Output>;

    /// Optional: Validate the event before handling
    async fn validate(&self, _event: &E) -> Result<()> {
        Ok(())
    }

    /// Optional: Handle errors that occur during processing
    async fn on_error(&self, event: &E, error: &BillflowError) {
        tracing::error!(
            target: "billflow::webhooks",
            event_id = event.event_id(),
            event_type = event.event_type(),
            error = %error,
            "Webhook processing failed"
        );
    }
}

/// Result of routing one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome<T> {
    /// The handler ran and the event id is now remembered.
    Handled(T),
    /// The event id was seen before; the handler did not run.
    Duplicate,
}

/// Dispatches verified events to a handler with idempotency
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookRouter;

impl WebhookRouter {
    pub fn new() -> Self {
        Self
    }

    /// Process a webhook event with the given handler
    ///
    /// The event id is marked processed only after the handler succeeds, so a
    /// failed delivery is retried by the sender.
    pub async fn process<E, H>(
        &self,
        event: &E,
        handler: &H,
        idempotency_store: &dyn IdempotencyStore,
    ) -> Result<RouteOutcome<H::Output>>
    where
        E: WebhookEvent,
        H: WebhookHandler<E>,
    {
        if idempotency_store.is_processed(event.event_id()).await? {
            tracing::debug!(
                target: "billflow::webhooks",
                event_id = event.event_id(),
                "Skipping already processed event"
            );
            return Ok(RouteOutcome::Duplicate);
        }

        handler.validate(event).await?;

        match handler.handle(event).await {
            Ok(output) => {
                idempotency_store
                    .mark_processed(event.event_id().to_string())
                    .await?;

                tracing::info!(
                    target: "billflow::webhooks",
                    event_id = event.event_id(),
                    event_type = event.event_type(),
                    "Webhook processed successfully"
                );

                Ok(RouteOutcome::Handled(output))
            }
            Err(e) => {
                handler.on_error(event, &e).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::idempotency::MemoryIdempotencyStore;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct TestEvent {
        id: String,
        kind: String,
    }

    impl WebhookEvent for TestEvent {
        fn event_id(&self) -> &str {
            &self.id
        }

        fn event_type(&self) -> &str {
            &self.kind
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WebhookHandler<TestEvent> for CountingHandler {
        type Output = usize;

        async fn handle(&self, _event: &TestEvent) -> Result<usize> {
            if self.fail {
                return Err(BillflowError::internal("boom"));
            }
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn event() -> TestEvent {
        TestEvent {
            id: "evt_1".to_string(),
            kind: "card.created".to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_events_run_once() {
        let store = MemoryIdempotencyStore::new();
        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: false };
        let router = WebhookRouter::new();

        let first = router.process(&event(), &handler, &store).await.unwrap();
        let second = router.process(&event(), &handler, &store).await.unwrap();

        assert_eq!(first, RouteOutcome::Handled(1));
        assert_eq!(second, RouteOutcome::Duplicate);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_events_are_not_remembered() {
        let store = MemoryIdempotencyStore::new();
        let handler = CountingHandler { calls: AtomicUsize::new(0), fail: true };

        let result = WebhookRouter::new().process(&event(), &handler, &store).await;

        assert!(result.is_err());
        assert!(!store.is_processed("evt_1").await.unwrap());
    }
}
