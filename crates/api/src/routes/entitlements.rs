//! Entitlement check and usage endpoints

use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;
use taskforge_billing::{EntitlementDecision, PlanFeature, UsageStats};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /api/v1/entitlements/usage
///
/// Current usage stats for the authenticated user. 404 until the user has
/// a usage row.
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<UsageStats>> {
    let stats = state
        .entitlements
        .get_user_usage(user.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    /// `task` to check task creation
    #[serde(rename = "type")]
    pub check_type: Option<String>,
    /// Feature name to check feature access
    pub feature: Option<String>,
}

/// GET /api/v1/entitlements/check?type=task | ?feature=<name>
///
/// Always 200 with an allow/deny decision; denial is a result, not an
/// error.
pub async fn check(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<CheckQuery>,
) -> ApiResult<Json<EntitlementDecision>> {
    let decision = match (query.check_type.as_deref(), query.feature.as_deref()) {
        (Some("task"), _) => state.entitlements.can_create_task(user.user_id).await?,
        (None, Some(name)) => {
            let feature: PlanFeature = name
                .parse()
                .map_err(|_| ApiError::Validation(format!("Unknown feature: {}", name)))?;
            state
                .entitlements
                .has_feature_access(user.user_id, feature)
                .await?
        }
        _ => {
            return Err(ApiError::Validation(
                "Expected type=task or feature=<name>".to_string(),
            ))
        }
    };

    Ok(Json(decision))
}
