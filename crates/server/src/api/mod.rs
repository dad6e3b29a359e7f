pub mod campaigns;
pub mod health;
pub mod send;
pub mod webhooks;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use leafline_core::TenantId;
use leafline_pipeline::{Reconciler, SendService};
use leafline_queue::Queue;
use leafline_store::Store;
use leafline_telnyx::WebhookVerifier;

use crate::error::ServerError;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Gate-checked send entry point.
    pub send: Arc<SendService>,
    /// Webhook processing.
    pub reconciler: Arc<Reconciler>,
    /// Job producer for campaign triggers.
    pub queue: Queue,
    /// Durable state.
    pub store: Arc<dyn Store>,
    /// Webhook signature verifier. `None` disables verification (tests and
    /// local development only).
    pub verifier: Option<WebhookVerifier>,
}

/// Pull the operating tenant out of the `X-Tenant-Id` header.
pub(crate) fn tenant_from_headers(headers: &HeaderMap) -> Result<TenantId, ServerError> {
    headers
        .get("x-tenant-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(TenantId::new)
        .ok_or(ServerError::MissingTenant)
}

/// Build the Axum router with all API routes and middleware.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/api/sms/send", post(send::send_sms))
        .route("/api/campaigns/{id}/send", post(campaigns::send_campaign))
        .route("/webhooks/telnyx", post(webhooks::telnyx))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
