//! Shared application state

use std::sync::Arc;

use sqlx::PgPool;

use classpulse_billing::Billing;

/// State shared across request handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Billing services; `None` when Stripe is not configured, in which case
    /// billing routes answer 503.
    pub billing: Option<Arc<Billing>>,
    pub jwt_secret: String,
}

impl AppState {
    pub fn new(pool: PgPool, billing: Option<Arc<Billing>>, jwt_secret: String) -> Self {
        Self {
            pool,
            billing,
            jwt_secret,
        }
    }
}
