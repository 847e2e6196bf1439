//! Billing endpoints: Stripe webhook intake and metered usage display

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/v1/billing/webhook
///
/// Signature failures are the caller's fault (400); processing failures
/// are ours (5xx) and make Stripe redeliver.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or(ApiError::InvalidWebhookSignature)?;

    let event = state.webhooks.verify_event(&body, signature)?;
    state.webhooks.handle_event(&event).await?;

    Ok((StatusCode::OK, Json(json!({ "received": true }))))
}

#[derive(Serialize)]
pub struct MeteredUsageResponse {
    pub is_metered: bool,
    pub current_usage: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
}

/// GET /api/v1/billing/metered-usage
///
/// Overage reported to Stripe this billing period. Users without a
/// metered subscription get a zeroed response, not an error.
pub async fn metered_usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<MeteredUsageResponse>> {
    let not_metered = MeteredUsageResponse {
        is_metered: false,
        current_usage: 0,
        period_start: None,
        period_end: None,
    };

    let subscription = state.entitlements.current_subscription(user.user_id).await?;
    let stripe_subscription_id = match subscription.and_then(|sub| sub.stripe_subscription_id) {
        Some(id) => id,
        None => return Ok(Json(not_metered)),
    };

    match state
        .reporter
        .current_period_usage(&stripe_subscription_id)
        .await?
    {
        Some(usage) => Ok(Json(MeteredUsageResponse {
            is_metered: true,
            current_usage: usage.total_usage,
            period_start: usage.period_start,
            period_end: usage.period_end,
        })),
        None => Ok(Json(not_metered)),
    }
}
