//! Metered usage reporting
//!
//! Every created task is reported to Stripe as metered usage when the
//! user's subscription carries a metered item. Reporting is
//! fire-and-forget: the request path drops a message on a channel and
//! moves on, and a background task resolves the subscription and sends
//! the usage record. A Stripe outage can delay overage billing but never
//! a user action.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{
    CreateUsageRecord, RecurringUsageType, Subscription, SubscriptionId, SubscriptionItemId,
    UsageRecord, UsageRecordAction,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// A single usage report waiting to be sent
#[derive(Debug)]
pub(crate) struct ReportRequest {
    pub(crate) user_id: Uuid,
    pub(crate) quantity: u64,
}

/// Usage totals for the current billing period
#[derive(Debug, Clone, Serialize)]
pub struct PeriodUsage {
    pub total_usage: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

/// Sends usage reports without blocking the caller.
///
/// Dropping every handle closes the channel and lets the drain task finish
/// its backlog and exit.
#[derive(Clone)]
pub struct UsageReporterHandle {
    tx: mpsc::UnboundedSender<ReportRequest>,
}

impl UsageReporterHandle {
    /// Queue a usage report. Returns immediately; whether the user is on a
    /// metered subscription at all is the drain task's problem, and
    /// delivery failures are logged there, never surfaced to the caller.
    pub fn submit(&self, user_id: Uuid, quantity: u64) {
        let request = ReportRequest { user_id, quantity };
        if self.tx.send(request).is_err() {
            warn!(%user_id, "usage reporter is shut down, dropping usage report");
        }
    }
}

/// Reports metered usage to Stripe
#[derive(Clone)]
pub struct UsageReporter {
    pool: PgPool,
    stripe: StripeClient,
}

impl UsageReporter {
    pub fn new(pool: PgPool, stripe: StripeClient) -> Self {
        Self { pool, stripe }
    }

    /// Spawn the background drain task, returning the submission handle.
    pub fn spawn(&self) -> UsageReporterHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReportRequest>();
        let reporter = self.clone();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(err) = reporter.report(request.user_id, request.quantity).await {
                    error!(
                        user_id = %request.user_id,
                        quantity = request.quantity,
                        error = %err,
                        "failed to report metered usage to Stripe"
                    );
                }
            }
            debug!("usage reporter drain task exiting");
        });

        UsageReporterHandle { tx }
    }

    /// Report a usage increment for the user, if their subscription bills
    /// a metered item. Users without an active subscription, or whose
    /// subscription has no metered item, are a silent skip: most plans are
    /// not metered.
    async fn report(&self, user_id: Uuid, quantity: u64) -> BillingResult<()> {
        let stripe_subscription_id = match self.active_subscription_id(user_id).await? {
            Some(id) => id,
            None => {
                debug!(%user_id, "no active subscription, skipping usage report");
                return Ok(());
            }
        };

        let item_id = match self.find_metered_item(&stripe_subscription_id).await? {
            Some(id) => id,
            None => {
                debug!(%user_id, "subscription has no metered item, skipping usage report");
                return Ok(());
            }
        };

        let params = CreateUsageRecord {
            quantity,
            action: Some(UsageRecordAction::Increment),
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        };
        UsageRecord::create(self.stripe.inner(), &item_id, params).await?;

        info!(%user_id, quantity, "reported metered usage to Stripe");
        Ok(())
    }

    /// Stripe subscription id of the user's newest active/trialing
    /// subscription, if any.
    async fn active_subscription_id(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT stripe_subscription_id FROM subscriptions
            WHERE user_id = $1 AND status IN ('active', 'trialing')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(id,)| id))
    }

    /// The subscription item billed per use, if the subscription has one.
    ///
    /// Metered Pro subscriptions carry two items on one subscription: the
    /// flat recurring price and the metered overage price.
    async fn find_metered_item(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionItemId>> {
        let sub_id: SubscriptionId = stripe_subscription_id.parse().map_err(|_| {
            BillingError::StripeApi(format!(
                "invalid subscription id: {}",
                stripe_subscription_id
            ))
        })?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        Ok(subscription
            .items
            .data
            .into_iter()
            .find(|item| {
                item.price
                    .as_ref()
                    .and_then(|price| price.recurring.as_ref())
                    .map(|recurring| recurring.usage_type == RecurringUsageType::Metered)
                    .unwrap_or(false)
            })
            .map(|item| item.id))
    }

    /// Current-period usage totals for the subscription's metered item.
    ///
    /// Usage record summaries are not exposed by our pinned async-stripe
    /// version, so this goes through the raw API.
    pub async fn current_period_usage(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<PeriodUsage>> {
        let item_id = match self.find_metered_item(stripe_subscription_id).await? {
            Some(id) => id,
            None => return Ok(None),
        };

        let body = self
            .stripe
            .get_raw(&format!(
                "/subscription_items/{}/usage_record_summaries?limit=1",
                item_id
            ))
            .await?;

        Ok(parse_usage_summary(&body))
    }
}

/// Pull the latest summary out of a usage_record_summaries list response.
fn parse_usage_summary(body: &serde_json::Value) -> Option<PeriodUsage> {
    let summary = body.pointer("/data/0")?;
    let total_usage = summary.get("total_usage")?.as_i64()?;
    let period_start = summary
        .pointer("/period/start")
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
    let period_end = summary
        .pointer("/period/end")
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

    Some(PeriodUsage {
        total_usage,
        period_start,
        period_end,
    })
}

#[cfg(test)]
pub(crate) fn test_channel() -> (UsageReporterHandle, mpsc::UnboundedReceiver<ReportRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (UsageReporterHandle { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_submit_never_blocks() {
        let (handle, _rx) = test_channel();
        // The channel is unbounded: a burst of submissions completes without
        // waiting on any database or Stripe call.
        for _ in 0..1000 {
            handle.submit(Uuid::new_v4(), 1);
        }
    }

    #[tokio::test]
    async fn test_submit_carries_user_and_quantity() {
        let (handle, mut rx) = test_channel();
        let user_id = Uuid::new_v4();

        handle.submit(user_id, 1);

        let request = rx.try_recv().unwrap();
        assert_eq!(request.user_id, user_id);
        assert_eq!(request.quantity, 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_dropped() {
        let (handle, rx) = test_channel();
        drop(rx);
        // Must not panic or error out
        handle.submit(Uuid::new_v4(), 1);
    }

    #[test]
    fn test_parse_usage_summary() {
        let body = json!({
            "object": "list",
            "data": [{
                "id": "urs_123",
                "total_usage": 42,
                "period": { "start": 1_700_000_000, "end": 1_702_592_000 }
            }]
        });
        let usage = parse_usage_summary(&body).unwrap();
        assert_eq!(usage.total_usage, 42);
        assert!(usage.period_start.is_some());
        assert!(usage.period_end.is_some());
    }

    #[test]
    fn test_parse_usage_summary_empty_list() {
        let body = json!({ "object": "list", "data": [] });
        assert!(parse_usage_summary(&body).is_none());
    }

    #[test]
    fn test_parse_usage_summary_null_period() {
        let body = json!({
            "data": [{ "total_usage": 0, "period": { "start": null, "end": null } }]
        });
        let usage = parse_usage_summary(&body).unwrap();
        assert_eq!(usage.total_usage, 0);
        assert!(usage.period_start.is_none());
    }
}
