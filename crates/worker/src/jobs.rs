//! Scheduled reconciliation jobs
//!
//! Each job processes its candidates independently: one subscription's
//! failure is logged and never blocks the rest of the batch. All jobs are
//! safe to invoke manually for operational recovery.

use time::{Duration, OffsetDateTime};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

use classpulse_billing::{
    ActorType, Billing, BillingEventBuilder, BillingEventType, BillingNotification,
    BillingNotifier, PaymentGateway,
};

/// Batch size per sweep run. Remaining candidates are picked up next tick.
const SWEEP_BATCH_SIZE: i64 = 100;

/// How far ahead of trial end the reminder goes out.
const TRIAL_WARNING_DAYS: i64 = 3;

/// Apply staged downgrades whose billing period has ended: `renew_period`
/// advances the period and promotes `pending_quantity` to `quantity`.
pub async fn apply_pending_quantities(billing: &Billing) {
    let now = OffsetDateTime::now_utc();
    let due = match billing.store.find_pending_quantity_due(now, SWEEP_BATCH_SIZE).await {
        Ok(due) => due,
        Err(e) => {
            error!(error = %e, "Failed to fetch subscriptions for pending-quantity sweep");
            return;
        }
    };

    if due.is_empty() {
        return; // No work to do
    }

    info!(count = due.len(), "Applying staged quantity changes");

    for mut sub in due {
        let previous_quantity = sub.quantity();
        let staged = sub.pending_quantity();

        let result = match sub.renew_period() {
            Ok(()) => billing.store.save(&sub).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    subscription_id = %sub.id(),
                    org_id = %sub.org_id(),
                    previous_quantity = previous_quantity,
                    new_quantity = sub.quantity(),
                    "Applied staged quantity at renewal"
                );
                billing
                    .events
                    .log_event_soft(
                        BillingEventBuilder::new(
                            sub.org_id(),
                            BillingEventType::QuantityChangeCompleted,
                        )
                        .data(serde_json::json!({
                            "previous_quantity": previous_quantity,
                            "new_quantity": sub.quantity(),
                            "applied_by": "renewal_sweep",
                        }))
                        .actor_type(ActorType::System),
                    )
                    .await;
            }
            Err(e) => {
                error!(
                    subscription_id = %sub.id(),
                    org_id = %sub.org_id(),
                    staged_quantity = ?staged,
                    error = %e,
                    "Failed to apply staged quantity, will retry next sweep"
                );
            }
        }
    }
}

/// Re-sync subscriptions whose period expired without a terminating webhook.
/// Covers missed or delayed webhook delivery by re-fetching the external
/// subscription and re-running the update reconciliation path.
pub async fn sync_expired_subscriptions(billing: &Billing) {
    let now = OffsetDateTime::now_utc();
    let expired = match billing.store.find_expired_unsynced(now, SWEEP_BATCH_SIZE).await {
        Ok(expired) => expired,
        Err(e) => {
            error!(error = %e, "Failed to fetch subscriptions for expired-period sync");
            return;
        }
    };

    if expired.is_empty() {
        return;
    }

    info!(count = expired.len(), "Re-syncing expired subscriptions from processor");

    for sub in expired {
        let Some(external_id) = sub.stripe_subscription_id().map(str::to_string) else {
            continue;
        };

        let strategy = ExponentialBackoff::from_millis(500).map(jitter).take(3);
        let remote = Retry::spawn(strategy, || {
            billing.gateway.retrieve_subscription(&external_id)
        })
        .await;

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                error!(
                    subscription_id = %sub.id(),
                    stripe_subscription_id = %external_id,
                    error = %e,
                    "Failed to fetch external subscription after retries"
                );
                continue;
            }
        };

        let subscription_id = sub.id();
        match billing.webhooks.apply_remote_state(sub, &remote).await {
            Ok(synced) => {
                info!(
                    subscription_id = %synced.id(),
                    stripe_subscription_id = %external_id,
                    status = %synced.status(),
                    "Re-synced expired subscription"
                );
            }
            Err(e) => {
                error!(
                    subscription_id = %subscription_id,
                    stripe_subscription_id = %external_id,
                    error = %e,
                    "Failed to apply external state during resync"
                );
            }
        }
    }
}

/// Warn organizations whose trial ends soon. The TRIAL_ENDING audit event
/// doubles as the per-trial dedup marker.
pub async fn notify_trial_ending(billing: &Billing) {
    let now = OffsetDateTime::now_utc();
    let window = Duration::days(TRIAL_WARNING_DAYS);
    let ending = match billing.store.find_trials_ending(now, window, SWEEP_BATCH_SIZE).await {
        Ok(ending) => ending,
        Err(e) => {
            error!(error = %e, "Failed to fetch ending trials");
            return;
        }
    };

    for sub in ending {
        let Some(trial_end) = sub.trial_end() else {
            continue;
        };

        // Record the marker first so a notification failure does not spam
        // the organization on every sweep.
        let logged = billing
            .events
            .log_event(
                BillingEventBuilder::new(sub.org_id(), BillingEventType::TrialEnding)
                    .data(serde_json::json!({
                        "subscription_id": sub.id(),
                        "trial_end": trial_end.unix_timestamp(),
                    }))
                    .actor_type(ActorType::System),
            )
            .await;
        if let Err(e) = logged {
            error!(
                subscription_id = %sub.id(),
                error = %e,
                "Failed to record trial-ending marker, skipping notification"
            );
            continue;
        }

        if let Err(e) = billing
            .notifier
            .notify(BillingNotification::TrialEnding {
                org_id: sub.org_id(),
                trial_end,
            })
            .await
        {
            warn!(
                subscription_id = %sub.id(),
                org_id = %sub.org_id(),
                error = %e,
                "Trial-ending notification failed - will not retry"
            );
        }
    }
}
