//! Plan and tier lookups, and per-quantity price resolution
//!
//! A tier maps (plan, billing period, class-count range) to a unit price.
//! `price_per_unit_cents` is the full price for the tier's billing period:
//! annual tiers store annual unit prices, so resolution never multiplies
//! by twelve.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use classpulse_shared::types::{is_valid_quantity, BillingPeriod};

use crate::error::{BillingError, BillingResult};

/// A subscription plan. Read-only from the billing engine's perspective;
/// plan administration lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SubscriptionPlan {
    pub id: Uuid,
    pub name: String,
    pub is_free: bool,
    pub is_active: bool,
    pub trial_period_days: i32,
    pub base_price_cents: i64,
    pub stripe_product_id: Option<String>,
}

/// A pricing tier row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PricingTier {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub billing_period: BillingPeriod,
    pub min_classes: i32,
    pub max_classes: i32,
    pub price_per_unit_cents: i64,
    pub stripe_price_id: Option<String>,
}

impl PricingTier {
    pub fn covers(&self, quantity: i32) -> bool {
        quantity >= self.min_classes && quantity <= self.max_classes
    }
}

/// Resolved price for a (plan, period, quantity) triple.
#[derive(Debug, Clone, Serialize)]
pub struct PriceQuote {
    pub price_per_unit_cents: i64,
    pub total_price_cents: i64,
    pub tier: PricingTier,
}

/// Select the tier whose class-count range contains `quantity`.
/// Tier ranges are non-overlapping per plan + period, so the first match
/// is the only match.
pub fn select_tier(tiers: &[PricingTier], quantity: i32) -> Option<&PricingTier> {
    tiers.iter().find(|t| t.covers(quantity))
}

/// Pricing resolver: pure reads, no side effects.
#[derive(Clone)]
pub struct PricingService {
    pool: PgPool,
}

impl PricingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Look up a plan by id.
    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<SubscriptionPlan> {
        let plan: Option<SubscriptionPlan> = sqlx::query_as(
            r#"
            SELECT id, name, is_free, is_active, trial_period_days,
                   base_price_cents, stripe_product_id
            FROM subscription_plans
            WHERE id = $1
            "#,
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        plan.ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// Load all tiers for a plan + billing period.
    pub async fn get_tiers(
        &self,
        plan_id: Uuid,
        billing_period: BillingPeriod,
    ) -> BillingResult<Vec<PricingTier>> {
        let tiers: Vec<PricingTier> = sqlx::query_as(
            r#"
            SELECT id, plan_id, billing_period, min_classes, max_classes,
                   price_per_unit_cents, stripe_price_id
            FROM pricing_tiers
            WHERE plan_id = $1 AND billing_period = $2
            ORDER BY min_classes ASC
            "#,
        )
        .bind(plan_id)
        .bind(billing_period)
        .fetch_all(&self.pool)
        .await?;

        Ok(tiers)
    }

    /// Resolve the unit and total price for `quantity` classes of a plan.
    ///
    /// A quantity no tier covers is a gap in tier configuration, not a user
    /// error; it is logged with the full tier list for diagnostics.
    pub async fn resolve_price(
        &self,
        plan_id: Uuid,
        billing_period: BillingPeriod,
        quantity: i32,
    ) -> BillingResult<PriceQuote> {
        if !is_valid_quantity(quantity) {
            return Err(BillingError::InvalidQuantity(quantity));
        }

        let plan = self.get_plan(plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanNotActive(plan.name));
        }

        let tiers = self.get_tiers(plan_id, billing_period).await?;
        if tiers.is_empty() {
            return Err(BillingError::NoPricingTiers {
                plan_id: plan_id.to_string(),
                billing_period: billing_period.as_str().to_string(),
            });
        }

        let tier = match select_tier(&tiers, quantity) {
            Some(t) => t.clone(),
            None => {
                tracing::error!(
                    plan_id = %plan_id,
                    billing_period = %billing_period.as_str(),
                    quantity = quantity,
                    tiers = ?tiers,
                    "No pricing tier covers quantity; tier configuration has a gap"
                );
                return Err(BillingError::TierNotFound {
                    plan_id: plan_id.to_string(),
                    quantity,
                });
            }
        };

        Ok(PriceQuote {
            price_per_unit_cents: tier.price_per_unit_cents,
            total_price_cents: tier.price_per_unit_cents * i64::from(quantity),
            tier,
        })
    }
}

/// Public-facing slice of a tier for pricing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    pub min_classes: i32,
    pub max_classes: i32,
    pub price_per_unit_cents: i64,
}

impl From<&PricingTier> for TierSummary {
    fn from(t: &PricingTier) -> Self {
        Self {
            min_classes: t.min_classes,
            max_classes: t.max_classes,
            price_per_unit_cents: t.price_per_unit_cents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(min: i32, max: i32, unit_cents: i64) -> PricingTier {
        PricingTier {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            billing_period: BillingPeriod::Monthly,
            min_classes: min,
            max_classes: max,
            price_per_unit_cents: unit_cents,
            stripe_price_id: Some("price_test".to_string()),
        }
    }

    #[test]
    fn test_select_tier_gap_free_set_covers_all_quantities() {
        let tiers = vec![tier(1, 5, 900), tier(6, 10, 800), tier(11, 20, 700)];
        for q in 1..=20 {
            let t = select_tier(&tiers, q).expect("quantity must be covered");
            assert!(t.covers(q));
        }
        assert_eq!(select_tier(&tiers, 3).unwrap().price_per_unit_cents, 900);
        assert_eq!(select_tier(&tiers, 10).unwrap().price_per_unit_cents, 800);
        assert_eq!(select_tier(&tiers, 11).unwrap().price_per_unit_cents, 700);
    }

    #[test]
    fn test_select_tier_boundaries_are_inclusive() {
        let tiers = vec![tier(1, 5, 900)];
        assert!(select_tier(&tiers, 1).is_some());
        assert!(select_tier(&tiers, 5).is_some());
        assert!(select_tier(&tiers, 6).is_none());
    }

    #[test]
    fn test_select_tier_reports_configuration_gaps() {
        let tiers = vec![tier(1, 5, 900), tier(11, 20, 700)];
        assert!(select_tier(&tiers, 8).is_none());
    }

    #[test]
    fn test_total_is_unit_price_times_quantity() {
        let t = tier(1, 20, 750);
        let quantity = 13;
        let total = t.price_per_unit_cents * i64::from(quantity);
        assert_eq!(total, 9750);
    }
}
