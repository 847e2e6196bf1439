//! Entitlement decisions
//!
//! The allow/deny core: may this user create a task, may they use this
//! feature, and what does their usage look like. Decision policy differs by
//! concern:
//!
//! - Task creation fails OPEN on limit-resolution trouble (static defaults
//!   apply), because blocking all task creation on a Stripe blip is worse
//!   than briefly honoring a stale limit.
//! - Premium feature checks fail CLOSED: if Stripe entitlements cannot be
//!   verified, access is denied with a retryable message.

use serde::Serialize;
use sqlx::PgPool;
use taskforge_shared::{Subscription, SubscriptionPlan, TaskLimit};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::features::{messages, PlanFeature};
use crate::limits::LimitsResolver;
use crate::reporter::UsageReporterHandle;
use crate::usage::UsageStore;

/// Outcome of an entitlement check
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub upgrade_required: bool,
}

impl EntitlementDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            upgrade_required: false,
        }
    }

    pub fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            upgrade_required: false,
        }
    }

    pub fn deny_upgrade(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            upgrade_required: true,
        }
    }
}

/// A user's usage relative to their plan limits
#[derive(Debug, Clone, Serialize)]
pub struct UsageStats {
    pub plan: SubscriptionPlan,
    pub task_count: i64,
    pub max_tasks: TaskLimit,
    pub percentage_used: f64,
}

/// Whether one more task may be created under the plan's limit.
///
/// Free is a hard limit. Pro is a soft limit: creation is always allowed
/// and anything over the included amount bills as metered overage.
pub fn decide_task_creation(
    plan: SubscriptionPlan,
    limit: TaskLimit,
    task_count: i64,
) -> EntitlementDecision {
    match plan {
        SubscriptionPlan::Free => {
            if limit.allows(task_count) {
                EntitlementDecision::allow()
            } else {
                EntitlementDecision::deny_upgrade(messages::TASK_LIMIT)
            }
        }
        SubscriptionPlan::Pro => EntitlementDecision::allow(),
    }
}

/// Feature access given the plan and the customer's active entitlement
/// lookup keys.
pub fn decide_feature_access(
    feature: PlanFeature,
    plan: SubscriptionPlan,
    active_lookup_keys: &[String],
) -> EntitlementDecision {
    let lookup_key = match feature.stripe_lookup_key() {
        None => return EntitlementDecision::allow(),
        Some(key) => key,
    };

    if plan == SubscriptionPlan::Free {
        return EntitlementDecision::deny_upgrade(messages::UPGRADE_REQUIRED);
    }

    if active_lookup_keys.iter().any(|k| k == lookup_key) {
        EntitlementDecision::allow()
    } else {
        EntitlementDecision::deny(messages::FEATURE_UNAVAILABLE)
    }
}

/// Entitlement checks and usage counter mutation for a user.
#[derive(Clone)]
pub struct EntitlementService {
    pool: PgPool,
    stripe: StripeClient,
    resolver: std::sync::Arc<LimitsResolver>,
    usage: UsageStore,
    reporter: UsageReporterHandle,
}

impl EntitlementService {
    pub fn new(
        pool: PgPool,
        stripe: StripeClient,
        resolver: std::sync::Arc<LimitsResolver>,
        usage: UsageStore,
        reporter: UsageReporterHandle,
    ) -> Self {
        Self {
            pool,
            stripe,
            resolver,
            usage,
            reporter,
        }
    }

    /// The user's current subscription: the newest row whose status still
    /// grants service.
    pub async fn current_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT id, user_id, plan, status, stripe_customer_id,
                   stripe_subscription_id, stripe_price_id, current_period_end,
                   created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1
              AND status IN ('active', 'trialing', 'incomplete')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Usage stats: plan, counted tasks, resolved limit and the fraction
    /// consumed. `None` when the user is missing their subscription or
    /// usage row; both are created at signup, so absence means onboarding
    /// never completed.
    pub async fn get_user_usage(&self, user_id: Uuid) -> BillingResult<Option<UsageStats>> {
        let (subscription_result, usage_result) =
            tokio::join!(self.current_subscription(user_id), self.usage.try_get(user_id));

        let subscription = match subscription_result? {
            Some(sub) => sub,
            None => return Ok(None),
        };
        let usage = match usage_result? {
            Some(usage) => usage,
            None => return Ok(None),
        };

        let limits = self
            .resolver
            .resolve(subscription.plan, subscription.stripe_price_id.as_deref())
            .await;

        Ok(Some(UsageStats {
            plan: subscription.plan,
            task_count: usage.task_count,
            max_tasks: limits.max_tasks,
            percentage_used: limits.max_tasks.percentage_used(usage.task_count),
        }))
    }

    /// May the user create one more task right now.
    pub async fn can_create_task(&self, user_id: Uuid) -> BillingResult<EntitlementDecision> {
        let stats = match self.get_user_usage(user_id).await? {
            Some(stats) => stats,
            // A missing record is a denial, not an error
            None => return Ok(EntitlementDecision::deny(messages::SUBSCRIPTION_NOT_FOUND)),
        };

        let decision = decide_task_creation(stats.plan, stats.max_tasks, stats.task_count);
        debug!(
            %user_id,
            plan = %stats.plan,
            task_count = stats.task_count,
            allowed = decision.allowed,
            "task creation entitlement check"
        );
        Ok(decision)
    }

    /// May the user use this feature.
    ///
    /// Premium features require both a Pro plan and an active Stripe
    /// entitlement. Verification failures deny access rather than guess.
    pub async fn has_feature_access(
        &self,
        user_id: Uuid,
        feature: PlanFeature,
    ) -> BillingResult<EntitlementDecision> {
        if feature.is_basic() {
            return Ok(EntitlementDecision::allow());
        }

        let subscription = self.current_subscription(user_id).await?;
        let (plan, customer_id) = match &subscription {
            Some(sub) => (sub.plan, sub.stripe_customer_id.as_deref()),
            None => (SubscriptionPlan::Free, None),
        };

        if plan == SubscriptionPlan::Free {
            return Ok(EntitlementDecision::deny_upgrade(messages::UPGRADE_REQUIRED));
        }

        let customer_id = match customer_id {
            Some(id) => id,
            None => return Ok(EntitlementDecision::deny_upgrade(messages::UPGRADE_REQUIRED)),
        };

        let lookup_keys = match self.active_entitlement_lookup_keys(customer_id).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(%user_id, error = %err, "failed to verify entitlements with Stripe, denying access");
                return Ok(EntitlementDecision::deny(messages::VERIFICATION_FAILED));
            }
        };

        Ok(decide_feature_access(feature, plan, &lookup_keys))
    }

    /// Record a created task. Every increment queues a usage report; the
    /// reporter works out on its own time whether the user's subscription
    /// is metered, so the queue never blocks or fails this call.
    pub async fn increment_task_count(&self, user_id: Uuid) -> BillingResult<i64> {
        let new_count = self.usage.increment(user_id).await?;
        self.reporter.submit(user_id, 1);
        Ok(new_count)
    }

    /// Record a deleted task. Deletions are never reported to Stripe: a
    /// billed period's usage does not shrink retroactively.
    pub async fn decrement_task_count(&self, user_id: Uuid) -> BillingResult<i64> {
        self.usage.decrement(user_id).await
    }

    /// Lookup keys of the customer's active entitlements.
    ///
    /// Active entitlements are not exposed by our pinned async-stripe
    /// version, so this goes through the raw API.
    async fn active_entitlement_lookup_keys(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        let body = self
            .stripe
            .get_raw(&format!(
                "/entitlements/active_entitlements?customer={}",
                customer_id
            ))
            .await?;

        let keys = body
            .pointer("/data")
            .and_then(|data| data.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| entry.get("lookup_key"))
                    .filter_map(|key| key.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(keys)
    }
}
