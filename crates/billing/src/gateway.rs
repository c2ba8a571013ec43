//! Payment gateway adapter
//!
//! The reconciliation engine talks to the payment processor through the
//! `PaymentGateway` trait; `StripeGateway` is the production implementation.
//! Tests inject an in-memory fake instead of stubbing HTTP.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CreateBillingPortalSession, CreateCustomer, CreatePaymentIntent,
    CreateSubscription, CreateSubscriptionItems, Currency, Customer, CustomerId, Expandable,
    Invoice, InvoiceId, PaymentIntent, Subscription as StripeSubscription, SubscriptionId,
    SubscriptionPaymentBehavior, SubscriptionProrationBehavior, UpdateSubscription,
    UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Proration mode for external quantity updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationMode {
    /// No proration: this engine already computed and charged the delta.
    None,
    /// Let the processor generate proration line items.
    CreateProrations,
}

impl From<ProrationMode> for SubscriptionProrationBehavior {
    fn from(mode: ProrationMode) -> Self {
        match mode {
            ProrationMode::None => SubscriptionProrationBehavior::None,
            ProrationMode::CreateProrations => SubscriptionProrationBehavior::CreateProrations,
        }
    }
}

/// External customer handle.
#[derive(Debug, Clone)]
pub struct GatewayCustomer {
    pub id: String,
}

/// External subscription snapshot, reduced to the fields reconciliation
/// needs.
#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub quantity: Option<i32>,
}

/// External invoice snapshot used for read-back lookups.
#[derive(Debug, Clone)]
pub struct GatewayInvoice {
    pub id: String,
    pub subscription_id: Option<String>,
}

/// A standalone payment created outside the subscription's invoice cycle.
#[derive(Debug, Clone)]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    pub amount_cents: i64,
}

/// Parameters for creating an external subscription.
#[derive(Debug, Clone)]
pub struct NewGatewaySubscription {
    pub customer_id: String,
    pub price_id: String,
    pub quantity: i32,
    pub trial_days: Option<u32>,
    pub metadata: HashMap<String, String>,
}

/// Parameters for a standalone payment against the customer's default
/// payment method.
#[derive(Debug, Clone)]
pub struct NewGatewayPayment {
    pub customer_id: String,
    pub amount_cents: i64,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

/// Everything the reconciliation engine asks of the payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<GatewayCustomer>;

    async fn create_subscription(
        &self,
        params: NewGatewaySubscription,
    ) -> BillingResult<GatewaySubscription>;

    /// Update quantity and price on the external subscription with the given
    /// proration mode.
    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        price_id: &str,
        quantity: i32,
        proration: ProrationMode,
    ) -> BillingResult<GatewaySubscription>;

    /// Cancel immediately, or flag cancellation at period end.
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice>;

    /// Charge the customer's default payment method off-cycle.
    async fn create_payment(&self, params: NewGatewayPayment) -> BillingResult<GatewayPayment>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String>;
}

/// Production gateway over the Stripe API.
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn currency(&self) -> Currency {
        serde_json::from_value(serde_json::Value::String(
            self.stripe.config().currency.clone(),
        ))
        .unwrap_or(Currency::USD)
    }

    fn parse_customer_id(id: &str) -> BillingResult<CustomerId> {
        id.parse::<CustomerId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))
    }

    fn parse_subscription_id(id: &str) -> BillingResult<SubscriptionId> {
        id.parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))
    }

    fn map_subscription(sub: StripeSubscription) -> GatewaySubscription {
        let quantity = sub
            .items
            .data
            .first()
            .and_then(|item| item.quantity)
            .map(|q| q as i32);

        let customer_id = match &sub.customer {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        };

        GatewaySubscription {
            id: sub.id.to_string(),
            customer_id,
            status: sub.status.as_str().to_string(),
            current_period_start: OffsetDateTime::from_unix_timestamp(sub.current_period_start)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            current_period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end)
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            cancel_at_period_end: sub.cancel_at_period_end,
            quantity,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(
        &self,
        org_id: Uuid,
        email: &str,
        name: &str,
    ) -> BillingResult<GatewayCustomer> {
        let mut metadata = HashMap::new();
        metadata.insert("org_id".to_string(), org_id.to_string());
        metadata.insert("platform".to_string(), "classpulse".to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(
            org_id = %org_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );

        Ok(GatewayCustomer {
            id: customer.id.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        params: NewGatewaySubscription,
    ) -> BillingResult<GatewaySubscription> {
        let customer_id = Self::parse_customer_id(&params.customer_id)?;

        let mut create = CreateSubscription::new(customer_id);
        create.items = Some(vec![CreateSubscriptionItems {
            price: Some(params.price_id.clone()),
            quantity: Some(params.quantity as u64),
            ..Default::default()
        }]);
        create.trial_period_days = params.trial_days;
        create.metadata = Some(params.metadata);
        // Leave the first invoice open until payment confirms; activation
        // happens via the invoice.paid webhook.
        create.payment_behavior = Some(SubscriptionPaymentBehavior::DefaultIncomplete);

        let sub = StripeSubscription::create(self.stripe.inner(), create).await?;

        tracing::info!(
            subscription_id = %sub.id,
            quantity = params.quantity,
            "Created Stripe subscription"
        );

        Ok(Self::map_subscription(sub))
    }

    async fn update_subscription_quantity(
        &self,
        subscription_id: &str,
        price_id: &str,
        quantity: i32,
        proration: ProrationMode,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        // The item id is required to replace the priced line in place.
        let current = StripeSubscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::StripeApi(format!(
                    "Subscription {} has no items to update",
                    subscription_id
                ))
            })?;

        let update = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                quantity: Some(quantity as u64),
                ..Default::default()
            }]),
            proration_behavior: Some(proration.into()),
            ..Default::default()
        };

        let sub = StripeSubscription::update(self.stripe.inner(), &sub_id, update).await?;

        tracing::info!(
            subscription_id = %subscription_id,
            quantity = quantity,
            proration = ?proration,
            "Updated Stripe subscription quantity"
        );

        Ok(Self::map_subscription(sub))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let sub = if at_period_end {
            let update = UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            StripeSubscription::update(self.stripe.inner(), &sub_id, update).await?
        } else {
            StripeSubscription::cancel(self.stripe.inner(), &sub_id, Default::default()).await?
        };

        tracing::info!(
            subscription_id = %subscription_id,
            at_period_end = at_period_end,
            "Cancelled Stripe subscription"
        );

        Ok(Self::map_subscription(sub))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;
        let sub = StripeSubscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        Ok(Self::map_subscription(sub))
    }

    async fn retrieve_invoice(&self, invoice_id: &str) -> BillingResult<GatewayInvoice> {
        let id = invoice_id
            .parse::<InvoiceId>()
            .map_err(|e| BillingError::StripeApi(format!("Invalid invoice ID: {}", e)))?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &id, &[]).await?;

        Ok(GatewayInvoice {
            id: invoice.id.to_string(),
            subscription_id: invoice.subscription.map(|s| match s {
                Expandable::Id(id) => id.to_string(),
                Expandable::Object(sub) => sub.id.to_string(),
            }),
        })
    }

    async fn create_payment(&self, params: NewGatewayPayment) -> BillingResult<GatewayPayment> {
        let customer_id = Self::parse_customer_id(&params.customer_id)?;

        // Charge the default payment method on file; quantity-change charges
        // must not wait for an interactive checkout.
        let customer = Customer::retrieve(
            self.stripe.inner(),
            &customer_id,
            &["invoice_settings.default_payment_method"],
        )
        .await?;
        let payment_method = customer
            .invoice_settings
            .and_then(|settings| settings.default_payment_method)
            .map(|pm| match pm {
                Expandable::Id(id) => id,
                Expandable::Object(method) => method.id.clone(),
            });

        let mut create = CreatePaymentIntent::new(params.amount_cents, self.currency());
        create.customer = Some(customer_id);
        create.description = Some(&params.description);
        create.metadata = Some(params.metadata.clone());
        create.payment_method = payment_method;
        create.confirm = Some(true);

        let intent = PaymentIntent::create(self.stripe.inner(), create).await?;

        tracing::info!(
            payment_intent_id = %intent.id,
            amount_cents = params.amount_cents,
            customer_id = %params.customer_id,
            "Created standalone payment"
        );

        Ok(GatewayPayment {
            id: intent.id.to_string(),
            status: intent.status.as_str().to_string(),
            amount_cents: intent.amount,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<String> {
        let customer_id = Self::parse_customer_id(customer_id)?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(
            customer_id = %session.customer,
            "Created billing portal session"
        );

        Ok(session.url)
    }
}
