//! Common types used across Taskforge

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    Free,
    Pro,
}

impl Default for SubscriptionPlan {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionPlan {
    /// Default task limit for this plan.
    ///
    /// These are the static fallbacks. Pro limits are normally resolved from
    /// the Stripe product metadata so they can change without a deploy.
    pub fn default_max_tasks(&self) -> TaskLimit {
        match self {
            Self::Free => TaskLimit::Limited(10),
            Self::Pro => TaskLimit::Unlimited,
        }
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
        }
    }
}

impl std::str::FromStr for SubscriptionPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            _ => Err(format!("Invalid subscription plan: {}", s)),
        }
    }
}

/// Subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Incomplete,
    PastDue,
    Canceled,
    Unpaid,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Statuses under which a subscription is treated as the user's current one.
    ///
    /// Incomplete is included to tolerate payment-processing delays right
    /// after checkout.
    pub const CURRENT: [SubscriptionStatus; 3] = [
        SubscriptionStatus::Active,
        SubscriptionStatus::Trialing,
        SubscriptionStatus::Incomplete,
    ];

    pub fn is_current(&self) -> bool {
        Self::CURRENT.contains(self)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Trialing => write!(f, "trialing"),
            Self::Incomplete => write!(f, "incomplete"),
            Self::PastDue => write!(f, "past_due"),
            Self::Canceled => write!(f, "canceled"),
            Self::Unpaid => write!(f, "unpaid"),
        }
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "incomplete" => Ok(Self::Incomplete),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "unpaid" => Ok(Self::Unpaid),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

// =============================================================================
// Task Limits
// =============================================================================

/// A resolved task limit for a plan.
///
/// `Unlimited` is a true sentinel: it compares greater than every finite
/// count. It must never be flattened into a large finite number, because
/// limit values round-trip through API responses and usage percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLimit {
    Limited(u64),
    Unlimited,
}

impl TaskLimit {
    /// Whether a user at `task_count` may create one more task.
    pub fn allows(&self, task_count: i64) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Limited(max) => (task_count.max(0) as u64) < *max,
        }
    }

    /// Fraction of the limit consumed, as a percentage. Unlimited plans
    /// always report 0.
    pub fn percentage_used(&self, task_count: i64) -> f64 {
        match self {
            Self::Unlimited => 0.0,
            Self::Limited(0) => 100.0,
            Self::Limited(max) => (task_count.max(0) as f64 / *max as f64) * 100.0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

impl std::fmt::Display for TaskLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(max) => write!(f, "{}", max),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl Serialize for TaskLimit {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(max) => serializer.serialize_u64(*max),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// User model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub created_at: OffsetDateTime,
}

/// Subscription model
///
/// A user may accumulate historical rows; the "current" subscription is the
/// most recently created row whose status is in `SubscriptionStatus::CURRENT`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Per-user entitlement usage counters
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntitlementUsage {
    pub user_id: Uuid,
    pub task_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Webhook event ledger row
///
/// One row per Stripe event id; the unique constraint on
/// `stripe_event_id` is what makes duplicate deliveries a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_default() {
        assert_eq!(SubscriptionPlan::default(), SubscriptionPlan::Free);
    }

    #[test]
    fn test_plan_display_and_parse() {
        assert_eq!(format!("{}", SubscriptionPlan::Free), "free");
        assert_eq!(format!("{}", SubscriptionPlan::Pro), "pro");
        assert_eq!(
            "PRO".parse::<SubscriptionPlan>().unwrap(),
            SubscriptionPlan::Pro
        );
        assert!("enterprise".parse::<SubscriptionPlan>().is_err());
    }

    #[test]
    fn test_plan_default_limits() {
        assert_eq!(
            SubscriptionPlan::Free.default_max_tasks(),
            TaskLimit::Limited(10)
        );
        assert_eq!(SubscriptionPlan::Pro.default_max_tasks(), TaskLimit::Unlimited);
    }

    #[test]
    fn test_status_display_and_parse() {
        assert_eq!(format!("{}", SubscriptionStatus::PastDue), "past_due");
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }

    #[test]
    fn test_status_is_current() {
        assert!(SubscriptionStatus::Active.is_current());
        assert!(SubscriptionStatus::Trialing.is_current());
        assert!(SubscriptionStatus::Incomplete.is_current());
        assert!(!SubscriptionStatus::PastDue.is_current());
        assert!(!SubscriptionStatus::Canceled.is_current());
        assert!(!SubscriptionStatus::Unpaid.is_current());
    }

    #[test]
    fn test_task_limit_allows() {
        let limit = TaskLimit::Limited(2);
        assert!(limit.allows(0));
        assert!(limit.allows(1));
        assert!(!limit.allows(2));
        assert!(!limit.allows(3));

        // Unlimited compares greater than any finite count
        assert!(TaskLimit::Unlimited.allows(0));
        assert!(TaskLimit::Unlimited.allows(i64::MAX));
    }

    #[test]
    fn test_task_limit_negative_count_clamped() {
        // Counters never go negative in practice, but the comparison must
        // not panic or misbehave if one does.
        assert!(TaskLimit::Limited(1).allows(-5));
        assert_eq!(TaskLimit::Limited(10).percentage_used(-5), 0.0);
    }

    #[test]
    fn test_task_limit_percentage() {
        assert_eq!(TaskLimit::Limited(10).percentage_used(5), 50.0);
        assert_eq!(TaskLimit::Limited(10).percentage_used(10), 100.0);
        assert_eq!(TaskLimit::Unlimited.percentage_used(1_000_000), 0.0);
        assert_eq!(TaskLimit::Limited(0).percentage_used(0), 100.0);
    }

    #[test]
    fn test_task_limit_serialization() {
        assert_eq!(serde_json::to_string(&TaskLimit::Limited(10)).unwrap(), "10");
        assert_eq!(
            serde_json::to_string(&TaskLimit::Unlimited).unwrap(),
            "\"unlimited\""
        );
    }
}
