//! Subscription persistence
//!
//! Hydrates the `Subscription` entity from rows and writes it back. The
//! entity owns all mutation; this store only moves state across the
//! database boundary.

use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use time::OffsetDateTime;
use uuid::Uuid;

use classpulse_shared::types::{BillingPeriod, SubscriptionStatus};

use crate::error::{BillingError, BillingResult};
use crate::subscription::{Subscription, SubscriptionParts};

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, org_id, user_id, plan_id, billing_period, quantity, pending_quantity,
    status, trial_start, trial_end, current_period_start, current_period_end,
    cancelled_at, stripe_subscription_id, stripe_customer_id,
    created_at, updated_at
"#;

impl<'r> FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Subscription::from_parts(SubscriptionParts {
            id: row.try_get("id")?,
            org_id: row.try_get("org_id")?,
            user_id: row.try_get("user_id")?,
            plan_id: row.try_get("plan_id")?,
            billing_period: row.try_get::<BillingPeriod, _>("billing_period")?,
            quantity: row.try_get("quantity")?,
            pending_quantity: row.try_get("pending_quantity")?,
            status: row.try_get::<SubscriptionStatus, _>("status")?,
            trial_start: row.try_get("trial_start")?,
            trial_end: row.try_get("trial_end")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancelled_at: row.try_get("cancelled_at")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}

/// Store for subscription rows.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a freshly created subscription.
    pub async fn insert(&self, sub: &Subscription) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, org_id, user_id, plan_id, billing_period, quantity,
                pending_quantity, status, trial_start, trial_end,
                current_period_start, current_period_end, cancelled_at,
                stripe_subscription_id, stripe_customer_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(sub.id())
        .bind(sub.org_id())
        .bind(sub.user_id())
        .bind(sub.plan_id())
        .bind(sub.billing_period())
        .bind(sub.quantity())
        .bind(sub.pending_quantity())
        .bind(sub.status())
        .bind(sub.trial_start())
        .bind(sub.trial_end())
        .bind(sub.current_period_start())
        .bind(sub.current_period_end())
        .bind(sub.cancelled_at())
        .bind(sub.stripe_subscription_id())
        .bind(sub.stripe_customer_id())
        .bind(sub.created_at())
        .bind(sub.updated_at())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Persist entity state after a mutation.
    pub async fn save(&self, sub: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                billing_period = $2,
                quantity = $3,
                pending_quantity = $4,
                status = $5,
                trial_start = $6,
                trial_end = $7,
                current_period_start = $8,
                current_period_end = $9,
                cancelled_at = $10,
                stripe_subscription_id = $11,
                stripe_customer_id = $12,
                updated_at = $13
            WHERE id = $1
            "#,
        )
        .bind(sub.id())
        .bind(sub.billing_period())
        .bind(sub.quantity())
        .bind(sub.pending_quantity())
        .bind(sub.status())
        .bind(sub.trial_start())
        .bind(sub.trial_end())
        .bind(sub.current_period_start())
        .bind(sub.current_period_end())
        .bind(sub.cancelled_at())
        .bind(sub.stripe_subscription_id())
        .bind(sub.stripe_customer_id())
        .bind(sub.updated_at())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::SubscriptionNotFound(sub.id().to_string()));
        }
        Ok(())
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    pub async fn get_by_id(&self, id: Uuid) -> BillingResult<Subscription> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(id.to_string()))
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE stripe_subscription_id = $1"
        ))
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// The organization's current subscription, if any: the most recent row
    /// that is not terminal.
    pub async fn find_current_for_org(&self, org_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sub: Option<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE org_id = $1 AND status NOT IN ('cancelled', 'expired', 'failed')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(sub)
    }

    /// Active subscriptions with a staged downgrade whose period has ended.
    /// Fed to the pending-quantity sweep.
    pub async fn find_pending_quantity_due(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status IN ('active', 'trial')
              AND pending_quantity IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_end <= $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Trials ending within the warning window that have not been notified
    /// yet. The TRIAL_ENDING audit event doubles as the dedup marker, so the
    /// sweep stays idempotent across runs.
    pub async fn find_trials_ending(
        &self,
        now: OffsetDateTime,
        within: time::Duration,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions s
            WHERE s.status = 'trial'
              AND s.trial_end IS NOT NULL
              AND s.trial_end > $1
              AND s.trial_end <= $2
              AND NOT EXISTS (
                  SELECT 1 FROM billing_events e
                  WHERE e.org_id = s.org_id
                    AND e.event_type = 'TRIAL_ENDING'
                    AND e.created_at >= COALESCE(s.trial_start, s.created_at)
              )
            ORDER BY s.trial_end ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(now + within)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }

    /// Active/trialing subscriptions past their period end that still carry
    /// an external id: candidates for webhook-gap resync.
    pub async fn find_expired_unsynced(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let subs: Vec<Subscription> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM subscriptions
            WHERE status IN ('active', 'trial')
              AND stripe_subscription_id IS NOT NULL
              AND current_period_end IS NOT NULL
              AND current_period_end < $1
            ORDER BY current_period_end ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subs)
    }
}
