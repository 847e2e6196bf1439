//! Taskforge billing and entitlement core
//!
//! Everything that decides whether a user may do something under their plan,
//! and everything that keeps local billing state in sync with Stripe:
//!
//! - [`limits`]: plan limit resolution (Stripe product metadata with cache
//!   and static fallback)
//! - [`entitlements`]: allow/deny decisions for task creation and feature
//!   access, plus usage counter mutation
//! - [`usage`]: the durable per-user task counter
//! - [`webhooks`]: idempotent Stripe webhook reconciliation
//! - [`reporter`]: fire-and-forget metered usage reporting

pub mod client;
pub mod entitlements;
pub mod error;
pub mod features;
pub mod limits;
pub mod reporter;
pub mod usage;
pub mod webhooks;

pub use client::{StripeClient, StripeConfig};
pub use entitlements::{EntitlementDecision, EntitlementService, UsageStats};
pub use error::{BillingError, BillingResult};
pub use features::PlanFeature;
pub use limits::{LimitsCache, LimitsResolver, PlanLimits};
pub use reporter::{PeriodUsage, UsageReporter, UsageReporterHandle};
pub use usage::UsageStore;
pub use webhooks::WebhookHandler;
