//! Billing audit events
//!
//! Append-only log of billing operations. Events answer "why is this
//! organization on this quantity?" questions, reconstruct billing history,
//! and back reconciliation-gap investigations.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionExpired,

    // Quantity changes
    QuantityChanged,
    QuantityChangeScheduled,
    QuantityChangeCompleted,

    // Trial
    TrialStarted,
    TrialEnding,

    // Invoicing and payments
    InvoicePaid,
    PaymentFailed,

    // Reconciliation
    ExternalSyncApplied,
    ReconciliationGap,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionActivated => "SUBSCRIPTION_ACTIVATED",
            BillingEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            BillingEventType::QuantityChanged => "QUANTITY_CHANGED",
            BillingEventType::QuantityChangeScheduled => "QUANTITY_CHANGE_SCHEDULED",
            BillingEventType::QuantityChangeCompleted => "QUANTITY_CHANGE_COMPLETED",
            BillingEventType::TrialStarted => "TRIAL_STARTED",
            BillingEventType::TrialEnding => "TRIAL_ENDING",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::PaymentFailed => "PAYMENT_FAILED",
            BillingEventType::ExternalSyncApplied => "EXTERNAL_SYNC_APPLIED",
            BillingEventType::ReconciliationGap => "RECONCILIATION_GAP",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through the API
    User,
    /// System automation (scheduled jobs)
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub stripe_event_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    org_id: Uuid,
    event_type: BillingEventType,
    event_data: serde_json::Value,
    stripe_event_id: Option<String>,
    stripe_invoice_id: Option<String>,
    stripe_subscription_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl BillingEventBuilder {
    pub fn new(org_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            org_id,
            event_type,
            event_data: serde_json::json!({}),
            stripe_event_id: None,
            stripe_invoice_id: None,
            stripe_subscription_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the Stripe event ID
    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    /// Set the Stripe invoice ID
    pub fn stripe_invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.stripe_invoice_id = Some(invoice_id.into());
        self
    }

    /// Set the Stripe subscription ID
    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append a billing event.
    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                org_id,
                event_type,
                event_data,
                stripe_event_id,
                stripe_invoice_id,
                stripe_subscription_id,
                actor_id,
                actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(builder.org_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.stripe_event_id)
        .bind(&builder.stripe_invoice_id)
        .bind(&builder.stripe_subscription_id)
        .bind(builder.actor_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Append an event, logging instead of failing. Audit writes must never
    /// abort the billing operation they describe.
    pub async fn log_event_soft(&self, builder: BillingEventBuilder) {
        let org_id = builder.org_id;
        let event_type = builder.event_type;
        if let Err(e) = self.log_event(builder).await {
            tracing::error!(
                org_id = %org_id,
                event_type = %event_type,
                error = %e,
                "Failed to append billing event"
            );
        }
    }

    /// Get recent events for an organization
    pub async fn get_events_for_org(
        &self,
        org_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, org_id, event_type, event_data, stripe_event_id,
                   stripe_invoice_id, stripe_subscription_id, actor_id,
                   actor_type, created_at
            FROM billing_events
            WHERE org_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Get events related to a specific Stripe subscription
    pub async fn get_events_for_subscription(
        &self,
        stripe_subscription_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            r#"
            SELECT id, org_id, event_type, event_data, stripe_event_id,
                   stripe_invoice_id, stripe_subscription_id, actor_id,
                   actor_type, created_at
            FROM billing_events
            WHERE stripe_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(stripe_subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_event_type_display() {
        assert_eq!(
            BillingEventType::SubscriptionActivated.to_string(),
            "SUBSCRIPTION_ACTIVATED"
        );
        assert_eq!(
            BillingEventType::QuantityChangeScheduled.to_string(),
            "QUANTITY_CHANGE_SCHEDULED"
        );
        assert_eq!(
            BillingEventType::ReconciliationGap.to_string(),
            "RECONCILIATION_GAP"
        );
    }

    #[test]
    fn test_actor_type_display() {
        assert_eq!(ActorType::User.to_string(), "user");
        assert_eq!(ActorType::System.to_string(), "system");
        assert_eq!(ActorType::Stripe.to_string(), "stripe");
    }

    #[test]
    fn test_event_builder() {
        let org_id = Uuid::new_v4();
        let builder = BillingEventBuilder::new(org_id, BillingEventType::QuantityChanged)
            .data(serde_json::json!({"from": 5, "to": 10}))
            .stripe_subscription("sub_123")
            .actor_type(ActorType::Stripe);

        assert_eq!(builder.org_id, org_id);
        assert_eq!(builder.event_type, BillingEventType::QuantityChanged);
        assert_eq!(builder.stripe_subscription_id, Some("sub_123".to_string()));
        assert_eq!(builder.actor_type, ActorType::Stripe);
    }
}
