//! Classpulse billing worker
//!
//! Runs the scheduled reconciliation jobs: pending-quantity sweep,
//! expired-period resync, and trial-ending reminders.

mod jobs;

use std::sync::Arc;

use anyhow::Context;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use classpulse_billing::Billing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = classpulse_shared::create_pool(&database_url)
        .await
        .context("failed to connect to database")?;

    classpulse_shared::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;

    let billing = Arc::new(Billing::from_env(pool).context("failed to initialize billing")?);
    info!("Billing worker starting");

    let mut scheduler = JobScheduler::new().await?;

    // Pending-quantity sweep: staged downgrades become effective shortly
    // after their period ends.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */10 * * * *", move |_id, _sched| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                jobs::apply_pending_quantities(&billing).await;
            })
        })?)
        .await?;

    // Expired-period resync: hourly safety net for missed webhooks.
    let sync_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_id, _sched| {
            let billing = sync_billing.clone();
            Box::pin(async move {
                jobs::sync_expired_subscriptions(&billing).await;
            })
        })?)
        .await?;

    // Trial reminders: daily.
    let trial_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 30 8 * * *", move |_id, _sched| {
            let billing = trial_billing.clone();
            Box::pin(async move {
                jobs::notify_trial_ending(&billing).await;
            })
        })?)
        .await?;

    scheduler.start().await?;
    info!("Scheduler started; jobs registered");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping worker");

    if let Err(e) = scheduler.shutdown().await {
        error!(error = %e, "Scheduler shutdown failed");
    }

    Ok(())
}
