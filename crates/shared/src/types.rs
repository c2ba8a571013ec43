//! Common types used across Classpulse

use serde::{Deserialize, Serialize};

/// Lowest billable unit count on any subscription.
pub const MIN_QUANTITY: i32 = 1;
/// Highest billable unit count on any subscription.
pub const MAX_QUANTITY: i32 = 20;

/// Returns true when `quantity` is a billable class count.
pub fn is_valid_quantity(quantity: i32) -> bool {
    (MIN_QUANTITY..=MAX_QUANTITY).contains(&quantity)
}

// =============================================================================
// Enums
// =============================================================================

/// Billing period for subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    #[default]
    Monthly,
    Annual,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "annual" | "yearly" | "year" => Some(Self::Annual),
            _ => None,
        }
    }
}

/// Internal subscription status vocabulary.
///
/// `Pending` means created but awaiting first payment confirmation from the
/// payment processor. `Cancelled` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
    Expired,
    Pending,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    /// Active for billing purposes: the org is entitled to the product.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::Trial)
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a user inside an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrgRole {
    Owner,
    Admin,
    Teacher,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Teacher => "teacher",
        }
    }

    /// Roles allowed to change billing settings for the organization.
    pub fn can_manage_billing(&self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_bounds() {
        assert!(is_valid_quantity(1));
        assert!(is_valid_quantity(20));
        assert!(!is_valid_quantity(0));
        assert!(!is_valid_quantity(21));
        assert!(!is_valid_quantity(-3));
    }

    #[test]
    fn test_billing_period_from_str() {
        assert_eq!(BillingPeriod::from_str("monthly"), Some(BillingPeriod::Monthly));
        assert_eq!(BillingPeriod::from_str("Annual"), Some(BillingPeriod::Annual));
        assert_eq!(BillingPeriod::from_str("yearly"), Some(BillingPeriod::Annual));
        assert_eq!(BillingPeriod::from_str("weekly"), None);
    }

    #[test]
    fn test_status_predicates() {
        assert!(SubscriptionStatus::Active.is_active());
        assert!(SubscriptionStatus::Trial.is_active());
        assert!(!SubscriptionStatus::Pending.is_active());
        assert!(SubscriptionStatus::Cancelled.is_terminal());
        assert!(SubscriptionStatus::Expired.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
    }

    #[test]
    fn test_role_billing_permission() {
        assert!(OrgRole::Owner.can_manage_billing());
        assert!(OrgRole::Admin.can_manage_billing());
        assert!(!OrgRole::Teacher.can_manage_billing());
    }
}
