//! Feature gating configuration
//!
//! Maps application features to Stripe entitlement lookup keys. Basic
//! features have no lookup key and are always available; premium features
//! are verified against the customer's active entitlements in Stripe.

use serde::{Deserialize, Serialize};

/// Denial messages shown to users
pub mod messages {
    pub const TASK_LIMIT: &str = "You have reached the task limit for the Free plan";
    pub const FEATURE_UNAVAILABLE: &str = "This feature is not available on your plan";
    pub const UPGRADE_REQUIRED: &str = "Upgrade to Pro to unlock this feature";
    pub const VERIFICATION_FAILED: &str = "Unable to verify feature access with Stripe";
    pub const SUBSCRIPTION_NOT_FOUND: &str = "Subscription not found";
}

/// Application features controlled by plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanFeature {
    TaskCreation,
    TaskDueDate,
    TaskPriority,
    TaskTags,
    DataExport,
}

impl PlanFeature {
    /// Stripe entitlement lookup key for this feature.
    ///
    /// `None` marks a basic feature: available on every plan with no
    /// provider check. The key strings must match the lookup keys
    /// configured in the Stripe dashboard.
    pub fn stripe_lookup_key(&self) -> Option<&'static str> {
        match self {
            Self::TaskCreation | Self::TaskDueDate => None,
            Self::TaskPriority => Some("task_priority"),
            Self::TaskTags => Some("task_tags"),
            Self::DataExport => Some("data_export"),
        }
    }

    pub fn is_basic(&self) -> bool {
        self.stripe_lookup_key().is_none()
    }
}

impl std::str::FromStr for PlanFeature {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_creation" | "taskCreation" => Ok(Self::TaskCreation),
            "task_due_date" | "taskDueDate" => Ok(Self::TaskDueDate),
            "task_priority" | "taskPriority" => Ok(Self::TaskPriority),
            "task_tags" | "taskTags" => Ok(Self::TaskTags),
            "data_export" | "dataExport" => Ok(Self::DataExport),
            _ => Err(format!("Unknown feature: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_features_have_no_lookup_key() {
        assert!(PlanFeature::TaskCreation.is_basic());
        assert!(PlanFeature::TaskDueDate.is_basic());
    }

    #[test]
    fn test_premium_features_map_to_lookup_keys() {
        assert_eq!(
            PlanFeature::TaskPriority.stripe_lookup_key(),
            Some("task_priority")
        );
        assert_eq!(PlanFeature::TaskTags.stripe_lookup_key(), Some("task_tags"));
        assert_eq!(
            PlanFeature::DataExport.stripe_lookup_key(),
            Some("data_export")
        );
    }

    #[test]
    fn test_feature_parse() {
        assert_eq!(
            "task_priority".parse::<PlanFeature>().unwrap(),
            PlanFeature::TaskPriority
        );
        // Callers coming from the old frontend still send camelCase
        assert_eq!(
            "taskDueDate".parse::<PlanFeature>().unwrap(),
            PlanFeature::TaskDueDate
        );
        assert!("sso".parse::<PlanFeature>().is_err());
    }
}
