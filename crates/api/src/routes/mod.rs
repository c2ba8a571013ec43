//! HTTP route wiring

pub mod billing;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::auth;
use crate::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Build the application router. The webhook route is unauthenticated by
/// design: it authenticates with the signature over the raw body instead.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/billing/subscription",
            get(billing::get_subscription).post(billing::create_subscription),
        )
        .route("/billing/subscription/cancel", post(billing::cancel_subscription))
        .route("/billing/subscription/quantity", post(billing::update_quantity))
        .route(
            "/billing/subscription/quantity/preview",
            get(billing::preview_quantity),
        )
        .route("/billing/invoices", get(billing::list_invoices))
        .route("/billing/portal", post(billing::create_portal_session))
        .route("/billing/plans/:plan_id/tiers", get(billing::get_plan_tiers))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/billing/webhook", post(billing::webhook))
        .merge(protected)
        .with_state(state)
}
