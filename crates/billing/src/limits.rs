//! Plan limit resolution
//!
//! Limits for paid plans live in Stripe product metadata so they can change
//! without a deploy. Resolution consults, in order: the static default for
//! plans that never have a price (Free), the in-process cache, then the
//! Stripe API. Any failure along the way falls back to the static default
//! for the plan; limit resolution must never block a user action on a
//! Stripe outage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use taskforge_shared::{SubscriptionPlan, TaskLimit};
use tracing::{debug, warn};

use crate::client::StripeClient;

/// Product metadata key holding the task limit
const METADATA_KEY: &str = "max_tasks";

/// How long a resolved limit stays fresh
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

/// Resolved limits for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub max_tasks: TaskLimit,
}

impl PlanLimits {
    pub fn defaults_for(plan: SubscriptionPlan) -> Self {
        Self {
            max_tasks: plan.default_max_tasks(),
        }
    }
}

/// Time source, injectable so cache expiry is testable
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

struct CacheEntry {
    limit: TaskLimit,
    inserted_at: Instant,
}

/// TTL cache of resolved limits, keyed by Stripe price id.
///
/// One entry per price, not per user: every Pro subscriber on the same
/// price shares a single Stripe lookup per TTL window.
pub struct LimitsCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LimitsCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Fresh cached limit for a price, if any. Expired entries are evicted
    /// on read.
    pub fn get(&self, price_id: &str) -> Option<TaskLimit> {
        let now = self.clock.now();
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match entries.get(price_id) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => Some(entry.limit),
            Some(_) => {
                entries.remove(price_id);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, price_id: &str, limit: TaskLimit) {
        let entry = CacheEntry {
            limit,
            inserted_at: self.clock.now(),
        };
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert(price_id.to_string(), entry);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.entries.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

impl Default for LimitsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

/// Parse a limit value from product metadata.
///
/// Accepts `"unlimited"`/`"infinity"` or a base-10 integer. Anything else
/// is rejected so a typo in the dashboard falls back to the plan default
/// instead of granting an accidental limit.
pub fn parse_limit(raw: &str) -> Option<TaskLimit> {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("unlimited") || trimmed.eq_ignore_ascii_case("infinity") {
        return Some(TaskLimit::Unlimited);
    }
    trimmed.parse::<u64>().ok().map(TaskLimit::Limited)
}

/// Resolves plan limits from Stripe product metadata with caching.
pub struct LimitsResolver {
    stripe: StripeClient,
    cache: Arc<LimitsCache>,
}

impl LimitsResolver {
    pub fn new(stripe: StripeClient, cache: Arc<LimitsCache>) -> Self {
        Self { stripe, cache }
    }

    /// Resolve the limits for a subscription.
    ///
    /// Free plans and subscriptions without a price never touch the
    /// network. Stripe failures log a warning and fall back to the plan's
    /// static default.
    pub async fn resolve(
        &self,
        plan: SubscriptionPlan,
        stripe_price_id: Option<&str>,
    ) -> PlanLimits {
        let price_id = match (plan, stripe_price_id) {
            (SubscriptionPlan::Free, _) | (_, None) => return PlanLimits::defaults_for(plan),
            (_, Some(id)) => id,
        };

        if let Some(limit) = self.cache.get(price_id) {
            debug!(price_id, %limit, "resolved task limit from cache");
            return PlanLimits { max_tasks: limit };
        }

        match self.fetch_limit_from_stripe(price_id).await {
            Ok(Some(limit)) => {
                self.cache.insert(price_id, limit);
                debug!(price_id, %limit, "resolved task limit from Stripe product metadata");
                PlanLimits { max_tasks: limit }
            }
            Ok(None) => {
                debug!(price_id, "product metadata has no usable task limit, using plan default");
                PlanLimits::defaults_for(plan)
            }
            Err(err) => {
                warn!(price_id, error = %err, "failed to resolve task limit from Stripe, using plan default");
                PlanLimits::defaults_for(plan)
            }
        }
    }

    async fn fetch_limit_from_stripe(
        &self,
        price_id: &str,
    ) -> Result<Option<TaskLimit>, crate::error::BillingError> {
        let parsed: stripe::PriceId = price_id
            .parse()
            .map_err(|_| crate::error::BillingError::StripeApi(format!(
                "invalid price id: {}",
                price_id
            )))?;

        let price = stripe::Price::retrieve(self.stripe.inner(), &parsed, &["product"]).await?;

        let product = match price.product {
            Some(stripe::Expandable::Object(product)) => *product,
            _ => return Ok(None),
        };

        Ok(product
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get(METADATA_KEY))
            .and_then(|raw| parse_limit(raw)))
    }
}
