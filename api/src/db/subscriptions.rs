use chrono::{DateTime, Utc};

use super::models::SubscriptionRow;
use super::{Db, sql, ts};
use crate::types::UserId;

/// 課金プロバイダから得た状態のうちローカルに写しておく値
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMirror {
    pub status: String,
    pub trial_active: bool,
    pub current_period_end: Option<DateTime<Utc>>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_subscription(
    pool: &Db,
    user_id: &UserId,
) -> Result<Option<SubscriptionRow>, sqlx::Error> {
    let q = sql("SELECT * FROM user_subscriptions WHERE user_id = ?");
    sqlx::query_as::<_, SubscriptionRow>(&q)
        .bind(user_id.as_str())
        .fetch_optional(pool)
        .await
}

/// 初回のみ試用期間の行を作る。既にあれば何もしない。
#[tracing::instrument(skip(pool), err)]
pub async fn create_trial(
    pool: &Db,
    user_id: &UserId,
    trial_ends_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "INSERT INTO user_subscriptions (user_id, status, trial_active, trial_ends_at) VALUES (?, ?, ?, ?)
         ON CONFLICT (user_id) DO NOTHING",
    );
    let result = sqlx::query(&q)
        .bind(user_id.as_str())
        .bind("trialing")
        .bind(true)
        .bind(ts(trial_ends_at))
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn upsert_mirror(
    pool: &Db,
    user_id: &UserId,
    mirror: &SubscriptionMirror,
) -> Result<(), sqlx::Error> {
    let q = sql(
        "INSERT INTO user_subscriptions (user_id, status, trial_active, current_period_end, stripe_customer_id, stripe_subscription_id)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (user_id) DO UPDATE SET status = excluded.status, trial_active = excluded.trial_active,
         current_period_end = excluded.current_period_end,
         stripe_customer_id = COALESCE(excluded.stripe_customer_id, user_subscriptions.stripe_customer_id),
         stripe_subscription_id = excluded.stripe_subscription_id, updated_at = ?",
    );
    sqlx::query(&q)
        .bind(user_id.as_str())
        .bind(&mirror.status)
        .bind(mirror.trial_active)
        .bind(mirror.current_period_end.map(ts))
        .bind(mirror.stripe_customer_id.as_deref())
        .bind(mirror.stripe_subscription_id.as_deref())
        .bind(ts(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}
