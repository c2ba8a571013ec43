//! Classpulse API server

use std::sync::Arc;

use anyhow::Context;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use classpulse_api::{routes, AppState, Config};
use classpulse_billing::Billing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;

    let pool = classpulse_shared::create_pool(&config.database_url)
        .await
        .context("failed to connect to database")?;
    classpulse_shared::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let billing = match Billing::from_env(pool.clone()) {
        Ok(billing) => Some(Arc::new(billing)),
        Err(e) => {
            warn!(error = %e, "Billing not configured; billing routes will answer 503");
            None
        }
    };

    let state = AppState::new(pool, billing, config.jwt_secret.clone());
    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .await
        .context("server exited with error")?;

    Ok(())
}
