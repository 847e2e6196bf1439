//! Durable per-user usage counters
//!
//! Counter mutations are single atomic UPDATE statements so concurrent
//! task creation never loses an increment.

use sqlx::PgPool;
use taskforge_shared::EntitlementUsage;
use uuid::Uuid;

use crate::error::BillingResult;

/// Per-user task counter backed by Postgres
#[derive(Clone)]
pub struct UsageStore {
    pool: PgPool,
}

impl UsageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensure a usage row exists for the user, starting at zero.
    pub async fn ensure_exists(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlement_usage (user_id, task_count)
            VALUES ($1, 0)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Usage row for a user, if one exists.
    pub async fn try_get(&self, user_id: Uuid) -> BillingResult<Option<EntitlementUsage>> {
        let row = sqlx::query_as(
            "SELECT user_id, task_count, created_at, updated_at FROM entitlement_usage WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Atomically increment the task counter, returning the new count.
    pub async fn increment(&self, user_id: Uuid) -> BillingResult<i64> {
        self.ensure_exists(user_id).await?;
        let (count,): (i64,) = sqlx::query_as(
            r#"
            UPDATE entitlement_usage
            SET task_count = task_count + 1, updated_at = NOW()
            WHERE user_id = $1
            RETURNING task_count
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Atomically decrement the task counter, clamped at zero.
    pub async fn decrement(&self, user_id: Uuid) -> BillingResult<i64> {
        self.ensure_exists(user_id).await?;
        let (count,): (i64,) = sqlx::query_as(
            r#"
            UPDATE entitlement_usage
            SET task_count = GREATEST(task_count - 1, 0), updated_at = NOW()
            WHERE user_id = $1
            RETURNING task_count
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
