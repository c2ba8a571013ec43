//! Classpulse Billing
//!
//! Subscription billing reconciliation engine: keeps the internal
//! subscription/invoice ledger consistent with the payment processor across
//! webhooks, mid-cycle quantity changes and scheduled sweeps.

pub mod client;
pub mod customer;
pub mod email;
pub mod error;
pub mod events;
pub mod gateway;
pub mod invoices;
pub mod portal;
pub mod pricing;
pub mod quantity;
pub mod store;
pub mod subscription;
pub mod subscriptions;
pub mod webhooks;

use std::sync::Arc;

use sqlx::PgPool;

pub use client::{StripeClient, StripeConfig};
pub use customer::CustomerService;
pub use email::{BillingEmailService, BillingNotification, BillingNotifier, EmailConfig};
pub use error::{BillingError, BillingResult};
pub use events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
pub use gateway::{
    GatewayCustomer, GatewayInvoice, GatewayPayment, GatewaySubscription, NewGatewayPayment,
    NewGatewaySubscription, PaymentGateway, ProrationMode, StripeGateway,
};
pub use invoices::{Invoice, InvoiceStatus, InvoiceStore, InvoiceUpsert};
pub use portal::{PortalResponse, PortalService};
pub use pricing::{PriceQuote, PricingService, PricingTier, SubscriptionPlan, TierSummary};
pub use quantity::{ProrationPreview, QuantityChangeOutcome, QuantityChangeService};
pub use store::SubscriptionStore;
pub use subscription::{map_external_status, ExternalSubscriptionState, Subscription};
pub use subscriptions::{CreateSubscriptionParams, SubscriptionService};
pub use webhooks::{WebhookEvent, WebhookOutcome, WebhookService};

/// All billing services wired together.
#[derive(Clone)]
pub struct Billing {
    pub pricing: PricingService,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub quantity: QuantityChangeService,
    pub webhooks: WebhookService,
    pub store: SubscriptionStore,
    pub invoices: InvoiceStore,
    pub portal: PortalService,
    pub events: BillingEventLogger,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn BillingNotifier>,
}

impl Billing {
    /// Wire the production stack: Stripe gateway, email notifier.
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        let stripe = StripeClient::new(config.clone());
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(stripe));
        let notifier: Arc<dyn BillingNotifier> =
            Arc::new(BillingEmailService::from_env(pool.clone()));
        Self::with_collaborators(config, pool, gateway, notifier)
    }

    /// Wire with explicit gateway and notifier implementations. Tests inject
    /// in-memory fakes here.
    pub fn with_collaborators(
        config: StripeConfig,
        pool: PgPool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        let invoices = InvoiceStore::new(pool.clone());
        let pricing = PricingService::new(pool.clone());
        let events = BillingEventLogger::new(pool.clone());
        let customers = CustomerService::new(pool.clone(), gateway.clone());

        let subscriptions = SubscriptionService::new(
            store.clone(),
            pricing.clone(),
            customers.clone(),
            gateway.clone(),
            events.clone(),
        );
        let quantity = QuantityChangeService::new(
            pool.clone(),
            store.clone(),
            pricing.clone(),
            gateway.clone(),
            events.clone(),
        );
        let webhooks = WebhookService::new(
            store.clone(),
            invoices.clone(),
            pricing.clone(),
            gateway.clone(),
            notifier.clone(),
            events.clone(),
            config.webhook_secret.clone(),
        );
        let portal = PortalService::new(gateway.clone(), &config);

        Self {
            pricing,
            customers,
            subscriptions,
            quantity,
            webhooks,
            store,
            invoices,
            portal,
            events,
            gateway,
            notifier,
        }
    }

    /// Wire from environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config, pool))
    }
}
