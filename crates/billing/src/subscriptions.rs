//! Subscription use-cases
//!
//! Creation, cancellation and lookups that tie the entity, the pricing
//! resolver, the customer mapping and the payment gateway together. The
//! webhook dispatcher owns activation; nothing here flips a `pending`
//! subscription to `active`.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use classpulse_shared::types::BillingPeriod;

use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::gateway::{NewGatewaySubscription, PaymentGateway};
use crate::pricing::PricingService;
use crate::store::SubscriptionStore;
use crate::subscription::Subscription;

/// Parameters for creating a subscription.
#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub plan_id: Uuid,
    pub billing_period: BillingPeriod,
    pub quantity: i32,
    /// Purchaser contact, used when an external customer must be created.
    pub email: String,
    pub name: String,
}

/// Subscription lifecycle service.
#[derive(Clone)]
pub struct SubscriptionService {
    store: SubscriptionStore,
    pricing: PricingService,
    customers: CustomerService,
    gateway: Arc<dyn PaymentGateway>,
    events: BillingEventLogger,
}

impl SubscriptionService {
    pub fn new(
        store: SubscriptionStore,
        pricing: PricingService,
        customers: CustomerService,
        gateway: Arc<dyn PaymentGateway>,
        events: BillingEventLogger,
    ) -> Self {
        Self {
            store,
            pricing,
            customers,
            gateway,
            events,
        }
    }

    /// Create a subscription for an organization.
    ///
    /// Free plans (and zero-priced tiers) activate locally without touching
    /// the gateway. Plans with trial days start entitled as `trial`. Paid,
    /// trial-less plans are created `pending` with the external subscription
    /// left `default_incomplete`; the invoice.paid webhook activates them.
    pub async fn create_subscription(
        &self,
        params: CreateSubscriptionParams,
    ) -> BillingResult<Subscription> {
        if let Some(existing) = self.store.find_current_for_org(params.org_id).await? {
            return Err(BillingError::InvalidInput(format!(
                "organization already has subscription {} in status {}",
                existing.id(),
                existing.status()
            )));
        }

        let plan = self.pricing.get_plan(params.plan_id).await?;
        if !plan.is_active {
            return Err(BillingError::PlanNotActive(plan.name));
        }
        let trial_days = i64::from(plan.trial_period_days.max(0));

        // Free plans carry no tiers; they activate locally without ever
        // touching the gateway.
        if plan.is_free {
            let sub = Subscription::create(
                params.user_id,
                params.org_id,
                params.plan_id,
                params.billing_period,
                params.quantity,
                trial_days,
            )?;
            self.store.insert(&sub).await?;
            self.log_created(&sub, &plan.name).await;
            return Ok(sub);
        }

        let quote = self
            .pricing
            .resolve_price(params.plan_id, params.billing_period, params.quantity)
            .await?;

        if quote.total_price_cents == 0 {
            let sub = Subscription::create(
                params.user_id,
                params.org_id,
                params.plan_id,
                params.billing_period,
                params.quantity,
                trial_days,
            )?;
            self.store.insert(&sub).await?;
            self.log_created(&sub, &plan.name).await;
            return Ok(sub);
        }

        // Paid plan: the tier must already be synced to the processor.
        let price_id = quote.tier.stripe_price_id.clone().ok_or_else(|| {
            BillingError::ReconciliationGap(format!(
                "pricing tier {} has no external price id",
                quote.tier.id
            ))
        })?;

        let customer_id = self
            .customers
            .get_or_create_customer(params.org_id, &params.email, &params.name)
            .await?;

        let mut sub = if trial_days > 0 {
            Subscription::create(
                params.user_id,
                params.org_id,
                params.plan_id,
                params.billing_period,
                params.quantity,
                trial_days,
            )?
        } else {
            Subscription::create_pending(
                params.user_id,
                params.org_id,
                params.plan_id,
                params.billing_period,
                params.quantity,
            )?
        };

        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), params.org_id.to_string());
        metadata.insert("subscription_id".to_string(), sub.id().to_string());

        let external = self
            .gateway
            .create_subscription(NewGatewaySubscription {
                customer_id: customer_id.clone(),
                price_id,
                quantity: params.quantity,
                trial_days: (trial_days > 0).then_some(trial_days as u32),
                metadata,
            })
            .await?;

        sub.link_external(&external.id, &customer_id)?;
        self.store.insert(&sub).await?;

        self.log_created(&sub, &plan.name).await;
        if trial_days > 0 {
            self.events
                .log_event_soft(
                    BillingEventBuilder::new(sub.org_id(), BillingEventType::TrialStarted)
                        .data(serde_json::json!({ "trial_days": trial_days }))
                        .actor(sub.user_id(), ActorType::User),
                )
                .await;
        }

        tracing::info!(
            org_id = %params.org_id,
            subscription_id = %sub.id(),
            stripe_subscription_id = %external.id,
            quantity = params.quantity,
            status = %sub.status(),
            "Created subscription"
        );

        Ok(sub)
    }

    /// Cancel the organization's subscription: immediately, or at the end of
    /// the current period.
    pub async fn cancel_subscription(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        immediate: bool,
    ) -> BillingResult<Subscription> {
        let mut sub = self
            .store
            .find_current_for_org(org_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(org_id.to_string()))?;

        if let Some(external_id) = sub.stripe_subscription_id().map(str::to_string) {
            self.gateway
                .cancel_subscription(&external_id, !immediate)
                .await?;
        }

        if immediate {
            sub.cancel()?;
        } else {
            sub.schedule_cancellation()?;
        }
        self.store.save(&sub).await?;

        self.events
            .log_event_soft(
                BillingEventBuilder::new(org_id, BillingEventType::SubscriptionCanceled)
                    .data(serde_json::json!({
                        "immediate": immediate,
                        "effective_at": sub.cancelled_at(),
                    }))
                    .actor(user_id, ActorType::User),
            )
            .await;

        tracing::info!(
            org_id = %org_id,
            subscription_id = %sub.id(),
            immediate = immediate,
            "Cancelled subscription"
        );

        Ok(sub)
    }

    /// The organization's current (non-terminal) subscription, if any.
    pub async fn get_current(&self, org_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.store.find_current_for_org(org_id).await
    }

    async fn log_created(&self, sub: &Subscription, plan_name: &str) {
        let mut builder = BillingEventBuilder::new(sub.org_id(), BillingEventType::SubscriptionCreated)
            .data(serde_json::json!({
                "plan": plan_name,
                "quantity": sub.quantity(),
                "billing_period": sub.billing_period().as_str(),
                "status": sub.status().as_str(),
            }))
            .actor(sub.user_id(), ActorType::User);
        if let Some(id) = sub.stripe_subscription_id() {
            builder = builder.stripe_subscription(id);
        }
        self.events.log_event_soft(builder).await;
    }
}
