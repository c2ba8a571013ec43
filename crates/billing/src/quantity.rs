//! Quantity-change orchestration
//!
//! Upgrades take effect immediately and bill the prorated difference for the
//! remainder of the period through a standalone payment. Downgrades never
//! shrink entitlement mid-period: the new quantity is staged and applied at
//! renewal. The external subscription is always updated with proration
//! disabled, because this engine computes and charges the delta itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use classpulse_shared::types::{is_valid_quantity, OrgRole};

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{NewGatewayPayment, PaymentGateway, ProrationMode};
use crate::pricing::PricingService;
use crate::store::SubscriptionStore;

/// Metadata tag that marks a standalone payment as a quantity-change charge.
/// The payment_intent.succeeded webhook completes the loop on it.
pub const QUANTITY_UPDATE_KIND: &str = "quantity_update";

/// Result of a quantity change request.
#[derive(Debug, Clone, Serialize)]
pub struct QuantityChangeOutcome {
    pub previous_quantity: i32,
    pub new_quantity: i32,
    pub is_upgrade: bool,
    pub requires_payment: bool,
    pub amount_due_cents: Option<i64>,
    pub effective_date: OffsetDateTime,
}

/// Proration preview for a prospective quantity change.
#[derive(Debug, Clone, Serialize)]
pub struct ProrationPreview {
    pub current_quantity: i32,
    pub new_quantity: i32,
    pub is_upgrade: bool,
    pub amount_due_cents: i64,
    pub days_remaining: i64,
    pub description: String,
}

/// Prorated charge for an upgrade: the price delta scaled by the remaining
/// share of the billing period, in whole days. An ended or malformed period
/// falls back to the full delta.
pub fn prorated_upgrade_cents(
    price_delta_cents: i64,
    now: OffsetDateTime,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
) -> i64 {
    let total_days = (period_end - period_start).whole_days();
    if total_days <= 0 || now >= period_end {
        return price_delta_cents.max(0);
    }
    let remaining_days = (period_end - now).whole_days();
    if remaining_days <= 0 {
        return price_delta_cents.max(0);
    }

    let prorated =
        (price_delta_cents as f64 * remaining_days as f64 / total_days as f64).round() as i64;
    prorated.max(0)
}

/// Days left in the period, floored at zero.
fn days_remaining(now: OffsetDateTime, period_end: OffsetDateTime) -> i64 {
    (period_end - now).whole_days().max(0)
}

/// Orchestrates mid-cycle quantity changes.
#[derive(Clone)]
pub struct QuantityChangeService {
    pool: PgPool,
    store: SubscriptionStore,
    pricing: PricingService,
    gateway: Arc<dyn PaymentGateway>,
    events: BillingEventLogger,
}

impl QuantityChangeService {
    pub fn new(
        pool: PgPool,
        store: SubscriptionStore,
        pricing: PricingService,
        gateway: Arc<dyn PaymentGateway>,
        events: BillingEventLogger,
    ) -> Self {
        Self {
            pool,
            store,
            pricing,
            gateway,
            events,
        }
    }

    /// Change the billable class count of a subscription.
    pub async fn change_quantity(
        &self,
        subscription_id: Uuid,
        new_quantity: i32,
        org_id: Uuid,
        requesting_user_id: Uuid,
    ) -> BillingResult<QuantityChangeOutcome> {
        if !is_valid_quantity(new_quantity) {
            return Err(BillingError::InvalidQuantity(new_quantity));
        }
        self.require_billing_role(org_id, requesting_user_id).await?;

        let mut sub = self.store.get_by_id(subscription_id).await?;
        if sub.org_id() != org_id {
            return Err(BillingError::OrganizationMismatch(org_id.to_string()));
        }
        if !sub.is_active() {
            return Err(BillingError::SubscriptionNotActive(sub.id().to_string()));
        }
        let previous_quantity = sub.quantity();
        if new_quantity == previous_quantity {
            return Err(BillingError::QuantityUnchanged(previous_quantity));
        }

        let previous_quote = self
            .pricing
            .resolve_price(sub.plan_id(), sub.billing_period(), previous_quantity)
            .await?;
        let new_quote = self
            .pricing
            .resolve_price(sub.plan_id(), sub.billing_period(), new_quantity)
            .await?;

        let now = OffsetDateTime::now_utc();
        let is_upgrade = new_quantity > previous_quantity;

        if is_upgrade {
            let amount_due = match (sub.current_period_start(), sub.current_period_end()) {
                (Some(start), Some(end)) => prorated_upgrade_cents(
                    new_quote.total_price_cents - previous_quote.total_price_cents,
                    now,
                    start,
                    end,
                ),
                _ => (new_quote.total_price_cents - previous_quote.total_price_cents).max(0),
            };
            let requires_payment = amount_due > 0;

            // External update first: if anything after this point fails, the
            // processor is authoritative and the webhook path reconciles.
            self.update_external_quantity(&sub, &new_quote.tier.stripe_price_id, new_quantity)
                .await?;

            if requires_payment {
                let customer_id = sub
                    .stripe_customer_id()
                    .map(str::to_string)
                    .ok_or_else(|| {
                        BillingError::ReconciliationGap(format!(
                            "subscription {} has no external customer to charge",
                            sub.id()
                        ))
                    })?;

                let mut metadata = HashMap::new();
                metadata.insert("type".to_string(), QUANTITY_UPDATE_KIND.to_string());
                metadata.insert("org_id".to_string(), org_id.to_string());
                metadata.insert("subscription_id".to_string(), sub.id().to_string());
                metadata.insert(
                    "previous_quantity".to_string(),
                    previous_quantity.to_string(),
                );
                metadata.insert("new_quantity".to_string(), new_quantity.to_string());

                let payment = self
                    .gateway
                    .create_payment(NewGatewayPayment {
                        customer_id,
                        amount_cents: amount_due,
                        description: format!(
                            "Prorated upgrade from {} to {} classes",
                            previous_quantity, new_quantity
                        ),
                        metadata,
                    })
                    .await;

                match payment {
                    Ok(p) => {
                        tracing::info!(
                            org_id = %org_id,
                            subscription_id = %sub.id(),
                            payment_intent_id = %p.id,
                            amount_cents = amount_due,
                            "Created prorated upgrade charge"
                        );
                    }
                    Err(e) => {
                        // The external quantity is already updated; holding
                        // back the internal grant would diverge the two
                        // ledgers further. Record the gap for follow-up.
                        tracing::error!(
                            org_id = %org_id,
                            subscription_id = %sub.id(),
                            amount_cents = amount_due,
                            error = %e,
                            "Upgrade charge failed after external quantity update; manual follow-up required"
                        );
                        self.events
                            .log_event_soft(
                                BillingEventBuilder::new(org_id, BillingEventType::ReconciliationGap)
                                    .data(serde_json::json!({
                                        "reason": "upgrade_charge_failed",
                                        "subscription_id": sub.id(),
                                        "amount_cents": amount_due,
                                        "error": e.to_string(),
                                    }))
                                    .actor(requesting_user_id, ActorType::User),
                            )
                            .await;
                    }
                }
            }

            // Grant immediately; payment reconciles asynchronously.
            sub.update_quantity(new_quantity, true)?;
            self.store.save(&sub).await?;

            self.log_change(
                org_id,
                requesting_user_id,
                &sub,
                previous_quantity,
                new_quantity,
                BillingEventType::QuantityChanged,
                requires_payment.then_some(amount_due),
            )
            .await;

            Ok(QuantityChangeOutcome {
                previous_quantity,
                new_quantity,
                is_upgrade: true,
                requires_payment,
                amount_due_cents: requires_payment.then_some(amount_due),
                effective_date: now,
            })
        } else {
            // Downgrade: align external invoicing with the next cycle now,
            // but keep the current entitlement until renewal.
            self.update_external_quantity(&sub, &new_quote.tier.stripe_price_id, new_quantity)
                .await?;

            sub.update_quantity(new_quantity, false)?;
            self.store.save(&sub).await?;

            let effective_date = sub.current_period_end().unwrap_or(now);

            self.log_change(
                org_id,
                requesting_user_id,
                &sub,
                previous_quantity,
                new_quantity,
                BillingEventType::QuantityChangeScheduled,
                None,
            )
            .await;

            Ok(QuantityChangeOutcome {
                previous_quantity,
                new_quantity,
                is_upgrade: false,
                requires_payment: false,
                amount_due_cents: None,
                effective_date,
            })
        }
    }

    /// Compute what a quantity change would cost, without side effects.
    pub async fn preview_change(
        &self,
        org_id: Uuid,
        new_quantity: i32,
    ) -> BillingResult<ProrationPreview> {
        if !is_valid_quantity(new_quantity) {
            return Err(BillingError::InvalidQuantity(new_quantity));
        }

        let sub = self
            .store
            .find_current_for_org(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        let current_quantity = sub.quantity();
        let previous_quote = self
            .pricing
            .resolve_price(sub.plan_id(), sub.billing_period(), current_quantity)
            .await?;
        let new_quote = self
            .pricing
            .resolve_price(sub.plan_id(), sub.billing_period(), new_quantity)
            .await?;

        let now = OffsetDateTime::now_utc();
        let is_upgrade = new_quantity > current_quantity;
        let remaining = sub
            .current_period_end()
            .map(|end| days_remaining(now, end))
            .unwrap_or(0);

        let amount_due = if is_upgrade {
            match (sub.current_period_start(), sub.current_period_end()) {
                (Some(start), Some(end)) => prorated_upgrade_cents(
                    new_quote.total_price_cents - previous_quote.total_price_cents,
                    now,
                    start,
                    end,
                ),
                _ => (new_quote.total_price_cents - previous_quote.total_price_cents).max(0),
            }
        } else {
            0
        };

        let description = if is_upgrade {
            format!(
                "Upgrading from {} to {} classes charges {} cents for the {} days left in the period",
                current_quantity, new_quantity, amount_due, remaining
            )
        } else {
            format!(
                "Downgrading from {} to {} classes takes effect at the end of the current period",
                current_quantity, new_quantity
            )
        };

        Ok(ProrationPreview {
            current_quantity,
            new_quantity,
            is_upgrade,
            amount_due_cents: amount_due,
            days_remaining: remaining,
            description,
        })
    }

    /// Push the new quantity to the processor with proration disabled.
    /// Subscriptions without an external counterpart (free plans) skip this.
    async fn update_external_quantity(
        &self,
        sub: &crate::subscription::Subscription,
        price_id: &Option<String>,
        new_quantity: i32,
    ) -> BillingResult<()> {
        let Some(external_id) = sub.stripe_subscription_id() else {
            return Ok(());
        };
        let price_id = price_id.as_deref().ok_or_else(|| {
            BillingError::ReconciliationGap(format!(
                "target tier for quantity {} has no external price id",
                new_quantity
            ))
        })?;

        self.gateway
            .update_subscription_quantity(external_id, price_id, new_quantity, ProrationMode::None)
            .await?;
        Ok(())
    }

    async fn require_billing_role(&self, org_id: Uuid, user_id: Uuid) -> BillingResult<()> {
        let role: Option<(OrgRole,)> = sqlx::query_as(
            "SELECT role FROM organization_members WHERE org_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match role {
            Some((role,)) if role.can_manage_billing() => Ok(()),
            _ => Err(BillingError::InsufficientPermissions(user_id.to_string())),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn log_change(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        sub: &crate::subscription::Subscription,
        previous_quantity: i32,
        new_quantity: i32,
        event_type: BillingEventType,
        amount_due_cents: Option<i64>,
    ) {
        let mut builder = BillingEventBuilder::new(org_id, event_type)
            .data(serde_json::json!({
                "previous_quantity": previous_quantity,
                "new_quantity": new_quantity,
                "amount_due_cents": amount_due_cents,
            }))
            .actor(user_id, ActorType::User);
        if let Some(id) = sub.stripe_subscription_id() {
            builder = builder.stripe_subscription(id);
        }
        self.events.log_event_soft(builder).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_proration_half_period_remaining() {
        // 15 of 30 days remaining at a 5000-cent delta charges half.
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        let now = start + Duration::days(15);
        assert_eq!(prorated_upgrade_cents(5000, now, start, end), 2500);
    }

    #[test]
    fn test_proration_full_period_remaining() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        assert_eq!(prorated_upgrade_cents(5000, start, start, end), 5000);
    }

    #[test]
    fn test_proration_rounds_to_nearest_cent() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        let now = start + Duration::days(20); // 10/30 remaining
        assert_eq!(prorated_upgrade_cents(1000, now, start, end), 333);
        let now = start + Duration::days(10); // 20/30 remaining
        assert_eq!(prorated_upgrade_cents(1000, now, start, end), 667);
    }

    #[test]
    fn test_proration_ended_period_charges_full_delta() {
        let start = OffsetDateTime::now_utc() - Duration::days(60);
        let end = start + Duration::days(30);
        let now = OffsetDateTime::now_utc();
        assert_eq!(prorated_upgrade_cents(5000, now, start, end), 5000);
    }

    #[test]
    fn test_proration_malformed_period_charges_full_delta() {
        let now = OffsetDateTime::now_utc();
        // Zero-length and inverted periods fall back to the full delta.
        assert_eq!(prorated_upgrade_cents(4200, now, now, now), 4200);
        assert_eq!(
            prorated_upgrade_cents(4200, now, now, now - Duration::days(3)),
            4200
        );
    }

    #[test]
    fn test_proration_never_negative() {
        let start = OffsetDateTime::now_utc();
        let end = start + Duration::days(30);
        let now = start + Duration::days(15);
        // A price decrease counted as an upgrade by unit count owes nothing.
        assert_eq!(prorated_upgrade_cents(-2000, now, start, end), 0);
    }

    #[test]
    fn test_days_remaining_floors_at_zero() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(days_remaining(now, now - Duration::days(2)), 0);
        assert_eq!(days_remaining(now, now + Duration::days(7)), 7);
    }
}
