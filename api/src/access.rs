//! 利用可否の判定（有料購読 または 試用期間中）。
//!
//! まず課金プロバイダに問い合わせて結果をローカルに写し、失敗したら写しから再計算する。
//! 判定結果はユーザごとにキャッシュする。画面向けの楽観的な応答は古いキャッシュでも返すが、
//! サーバ側での強制（キャンペーン開始）は TTL を過ぎたキャッシュを使わない。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::auth::AuthenticatedUser;
use crate::billing::BillingProvider;
use crate::db::subscriptions::SubscriptionMirror;
use crate::db::{self, Db, parse_ts};
use crate::error::AppError;
use crate::types::UserId;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessState {
    Trial,
    Active,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    Billing,
    Mirror,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessStatus {
    pub has_access: bool,
    pub subscribed: bool,
    pub trial_active: bool,
    pub status: AccessState,
    pub trial_days_left: i64,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub subscription_end: Option<DateTime<Utc>>,
    pub source: AccessSource,
}

impl AccessStatus {
    fn compute(
        now: DateTime<Utc>,
        subscribed: bool,
        trial_ends_at: Option<DateTime<Utc>>,
        subscription_end: Option<DateTime<Utc>>,
        source: AccessSource,
    ) -> Self {
        let trial_active = trial_ends_at.is_some_and(|end| end > now);
        let status = if subscribed {
            AccessState::Active
        } else if trial_active {
            AccessState::Trial
        } else {
            AccessState::Expired
        };
        Self {
            has_access: subscribed || trial_active,
            subscribed,
            trial_active,
            status,
            trial_days_left: trial_days_left(now, trial_ends_at),
            trial_ends_at,
            subscription_end,
            source,
        }
    }
}

/// 残り日数（切り上げ、0 未満にはしない）
pub fn trial_days_left(now: DateTime<Utc>, trial_ends_at: Option<DateTime<Utc>>) -> i64 {
    let Some(end) = trial_ends_at else {
        return 0;
    };
    let remaining = (end - now).num_milliseconds();
    if remaining <= 0 {
        return 0;
    }
    (remaining + DAY_MILLIS - 1) / DAY_MILLIS
}

struct CacheEntry {
    status: AccessStatus,
    checked_at: Instant,
}

#[derive(Clone)]
pub struct AccessGate {
    cache: Arc<RwLock<HashMap<UserId, CacheEntry>>>,
    ttl: Duration,
    trial_days: i64,
}

impl AccessGate {
    pub fn new(ttl: Duration, trial_days: i64) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            trial_days,
        }
    }

    /// 課金プロバイダ → 写しの順に判定し、結果をキャッシュする。
    pub async fn check(
        &self,
        pool: &Db,
        billing: Option<&dyn BillingProvider>,
        user: &AuthenticatedUser,
    ) -> Result<AccessStatus, AppError> {
        let now = Utc::now();
        let trial_ends_at = now + chrono::Duration::days(self.trial_days);
        if db::subscriptions::create_trial(pool, &user.user_id, trial_ends_at).await? {
            tracing::info!(user_id = %user.user_id, %trial_ends_at, "trial started");
        }

        let status = match billing {
            Some(billing) => match from_billing(pool, billing, user, now).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(user_id = %user.user_id, error = %e, "billing check failed, using mirror");
                    from_mirror(pool, &user.user_id, now).await?
                }
            },
            None => from_mirror(pool, &user.user_id, now).await?,
        };

        self.store(&user.user_id, status.clone()).await;
        Ok(status)
    }

    /// 経過時間にかかわらずキャッシュ済みの結果
    pub async fn cached(&self, user_id: &UserId) -> Option<AccessStatus> {
        let cache = self.cache.read().await;
        cache.get(user_id).map(|entry| entry.status.clone())
    }

    /// TTL 内のキャッシュ済みの結果
    pub async fn fresh(&self, user_id: &UserId) -> Option<AccessStatus> {
        let cache = self.cache.read().await;
        cache
            .get(user_id)
            .filter(|entry| entry.checked_at.elapsed() < self.ttl)
            .map(|entry| entry.status.clone())
    }

    pub async fn invalidate(&self, user_id: &UserId) {
        self.cache.write().await.remove(user_id);
    }

    async fn store(&self, user_id: &UserId, status: AccessStatus) {
        let mut cache = self.cache.write().await;
        cache.insert(
            user_id.clone(),
            CacheEntry {
                status,
                checked_at: Instant::now(),
            },
        );
    }

    /// 画面向け。利用可のキャッシュがあれば即座に返し、裏で再判定する。
    pub async fn check_optimistic(
        &self,
        pool: &Db,
        billing: Option<Arc<dyn BillingProvider>>,
        user: &AuthenticatedUser,
    ) -> Result<AccessStatus, AppError> {
        if let Some(cached) = self.cached(&user.user_id).await
            && cached.has_access
        {
            let gate = self.clone();
            let pool = pool.clone();
            let user = user.clone();
            tokio::spawn(async move {
                if let Err(e) = gate.check(&pool, billing.as_deref(), &user).await {
                    tracing::warn!(user_id = %user.user_id, error = %e, "background access refresh failed");
                }
            });
            return Ok(cached);
        }
        self.check(pool, billing.as_deref(), user).await
    }

    /// サーバ側の強制。TTL を過ぎたキャッシュは使わない。
    pub async fn require_access(
        &self,
        pool: &Db,
        billing: Option<&dyn BillingProvider>,
        user: &AuthenticatedUser,
    ) -> Result<AccessStatus, AppError> {
        let status = match self.fresh(&user.user_id).await {
            Some(status) if status.has_access => status,
            _ => self.check(pool, billing, user).await?,
        };
        if !status.has_access {
            return Err(AppError::Forbidden(
                "trial expired, an active subscription is required".into(),
            ));
        }
        Ok(status)
    }
}

async fn from_billing(
    pool: &Db,
    billing: &dyn BillingProvider,
    user: &AuthenticatedUser,
    now: DateTime<Utc>,
) -> Result<AccessStatus, AppError> {
    let row = db::subscriptions::get_subscription(pool, &user.user_id).await?;
    let trial_ends_at = row
        .as_ref()
        .and_then(|r| r.trial_ends_at.as_ref())
        .and_then(parse_ts);

    let customer_id = match &user.email {
        Some(email) => billing.find_customer(email).await?,
        None => None,
    };
    let subscription = match &customer_id {
        Some(customer_id) => billing.active_subscription(customer_id).await?,
        None => None,
    };

    let subscription_end = subscription.as_ref().and_then(|s| s.current_period_end);
    let subscribed = subscription
        .as_ref()
        .is_some_and(|s| s.current_period_end.is_none_or(|end| end > now));
    let status = AccessStatus::compute(
        now,
        subscribed,
        trial_ends_at,
        subscription_end,
        AccessSource::Billing,
    );

    let mirror = SubscriptionMirror {
        status: match status.status {
            AccessState::Active => "active",
            AccessState::Trial => "trialing",
            AccessState::Expired => "expired",
        }
        .to_string(),
        trial_active: status.trial_active,
        current_period_end: subscription_end,
        stripe_customer_id: customer_id,
        stripe_subscription_id: subscription.map(|s| s.id),
    };
    db::subscriptions::upsert_mirror(pool, &user.user_id, &mirror).await?;
    Ok(status)
}

async fn from_mirror(
    pool: &Db,
    user_id: &UserId,
    now: DateTime<Utc>,
) -> Result<AccessStatus, AppError> {
    let Some(row) = db::subscriptions::get_subscription(pool, user_id).await? else {
        return Ok(AccessStatus::compute(
            now,
            false,
            None,
            None,
            AccessSource::Mirror,
        ));
    };
    let trial_ends_at = row.trial_ends_at.as_ref().and_then(parse_ts);
    let period_end = row.current_period_end.as_ref().and_then(parse_ts);
    let subscribed = row.status == "active" && period_end.is_some_and(|end| end > now);
    Ok(AccessStatus::compute(
        now,
        subscribed,
        trial_ends_at,
        period_end,
        AccessSource::Mirror,
    ))
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use super::*;
    use crate::billing::ActiveSubscription;
    use crate::testing::{self, FakeBilling};

    fn user(id: &str) -> AuthenticatedUser {
        AuthenticatedUser {
            user_id: UserId(id.into()),
            email: Some(format!("{id}@example.com")),
            token: "token".into(),
        }
    }

    #[test]
    fn days_left_rounds_up() {
        let now = Utc::now();
        assert_eq!(trial_days_left(now, None), 0);
        assert_eq!(trial_days_left(now, Some(now - chrono::Duration::hours(1))), 0);
        assert_eq!(trial_days_left(now, Some(now + chrono::Duration::hours(1))), 1);
        assert_eq!(trial_days_left(now, Some(now + chrono::Duration::days(2))), 2);
    }

    #[tokio::test]
    async fn trial_without_billing_customer() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        let ends = Utc::now() + chrono::Duration::days(2);
        db::subscriptions::create_trial(&pool, &u.user_id, ends)
            .await
            .unwrap();

        let gate = AccessGate::new(Duration::from_secs(300), 7);
        let billing = FakeBilling::default();
        let status = gate.check(&pool, Some(&billing), &u).await.unwrap();

        assert!(status.has_access);
        assert!(!status.subscribed);
        assert_eq!(status.status, AccessState::Trial);
        assert_eq!(status.trial_days_left, 2);
        assert_eq!(status.source, AccessSource::Billing);
    }

    #[tokio::test]
    async fn first_check_starts_a_trial() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        let gate = AccessGate::new(Duration::from_secs(300), 7);
        let status = gate.check(&pool, None, &u).await.unwrap();
        assert!(status.trial_active);
        assert_eq!(status.trial_days_left, 7);
        assert_eq!(status.source, AccessSource::Mirror);
    }

    #[tokio::test]
    async fn active_subscription_is_mirrored() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        db::subscriptions::create_trial(&pool, &u.user_id, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        let billing = FakeBilling::with_subscription(
            "cus_1",
            ActiveSubscription {
                id: "sub_1".into(),
                status: "active".into(),
                current_period_end: Some(Utc::now() + chrono::Duration::days(20)),
            },
        );
        let gate = AccessGate::new(Duration::from_secs(300), 7);
        let status = gate.check(&pool, Some(&billing), &u).await.unwrap();
        assert!(status.subscribed);
        assert_eq!(status.status, AccessState::Active);

        let row = db::subscriptions::get_subscription(&pool, &u.user_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, "active");
        assert_eq!(row.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(row.stripe_subscription_id.as_deref(), Some("sub_1"));
    }

    #[tokio::test]
    async fn billing_failure_falls_back_to_mirror() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        db::subscriptions::upsert_mirror(
            &pool,
            &u.user_id,
            &SubscriptionMirror {
                status: "active".into(),
                trial_active: false,
                current_period_end: Some(Utc::now() + chrono::Duration::days(3)),
                stripe_customer_id: Some("cus_1".into()),
                stripe_subscription_id: Some("sub_1".into()),
            },
        )
        .await
        .unwrap();

        let gate = AccessGate::new(Duration::from_secs(300), 7);
        let status = gate
            .check(&pool, Some(&FakeBilling::failing()), &u)
            .await
            .unwrap();
        assert!(status.has_access);
        assert!(status.subscribed);
        assert_eq!(status.source, AccessSource::Mirror);
    }

    #[tokio::test]
    async fn expired_user_is_forbidden() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        db::subscriptions::create_trial(&pool, &u.user_id, Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        let gate = AccessGate::new(Duration::from_secs(300), 7);
        let err = gate
            .require_access(&pool, Some(&FakeBilling::default()), &u)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert_eq!(
            gate.cached(&u.user_id).await.unwrap().status,
            AccessState::Expired
        );
    }

    #[tokio::test]
    async fn stale_cache_is_not_trusted_for_enforcement() {
        let pool = testing::memory_pool().await;
        let u = user("u1");
        let gate = AccessGate::new(Duration::ZERO, 7);
        gate.check(&pool, None, &u).await.unwrap();
        assert!(gate.cached(&u.user_id).await.is_some());
        assert!(gate.fresh(&u.user_id).await.is_none());
    }
}
