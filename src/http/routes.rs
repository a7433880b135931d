use axum::{Router, extract::DefaultBodyLimit};

use super::billing::BillingRoutes;
use super::state::AppState;
use super::subscriptions::SubscriptionRoutes;
use super::webhooks::WebhookRoutes;
use crate::billing::{BillingStore, PaymentGateway};

/// Trait for composable route modules
///
/// Each module registers its own routes against the shared state type and
/// is composed into the application router by [`router`].
///
/// # Example
///
/// ```ignore
/// struct InvoicesModule;
///
/// impl<S: BillingStore, G: PaymentGateway> RouteModule<AppState<S, G>> for InvoicesModule {
///     fn routes(&self) -> Router<AppState<S, G>> {
///         Router::new().route("/{id}", get(get_invoice::<S, G>))
///     }
///
///     fn prefix(&self) -> Option<&str> {
///         Some("/invoices")
///     }
/// }
/// ```
pub trait RouteModule<St: Clone + Send + Sync + 'static> {
    /// Returns a router with all routes for this module, without state applied
    fn routes(&self) -> Router<St>;

    /// Optional: specify a path prefix for all routes in this module
    fn prefix(&self) -> Option<&str> {
        None
    }

    /// Registers this module's routes into the application router
    fn register(self, router: Router<St>) -> Router<St>
    where
        Self: Sized,
    {
        let routes = self.routes();

        if let Some(prefix) = self.prefix() {
            router.nest(prefix, routes)
        } else {
            router.merge(routes)
        }
    }
}

/// Build the full application router.
pub fn router<S, G>(state: AppState<S, G>) -> Router
where
    S: BillingStore + 'static,
    G: PaymentGateway + 'static,
{
    let body_limit = state.max_body_size;

    let router: Router<AppState<S, G>> = Router::new();
    let router = WebhookRoutes.register(router);
    let router = SubscriptionRoutes.register(router);
    let router = BillingRoutes.register(router);

    router
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
