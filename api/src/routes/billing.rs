use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::access::AccessStatus;
use crate::auth::AuthenticatedUser;
use crate::billing::{BillingProvider, CheckoutCustomer};
use crate::db;
use crate::error::AppError;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/billing/status", get(billing_status))
        .route("/billing/checkout", post(checkout))
        .route("/billing/portal", post(portal))
}

fn billing(state: &AppState) -> Result<Arc<dyn BillingProvider>, AppError> {
    state
        .billing
        .clone()
        .ok_or_else(|| AppError::Config("billing provider is not configured".into()))
}

fn email(auth: &AuthenticatedUser) -> Result<&str, AppError> {
    auth.email
        .as_deref()
        .ok_or_else(|| AppError::PreconditionFailed("account has no email address".into()))
}

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    optimistic: bool,
}

async fn billing_status(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<AccessStatus>, AppError> {
    let status = if query.optimistic {
        state
            .access
            .check_optimistic(&state.pool, state.billing.clone(), &auth)
            .await?
    } else {
        state
            .access
            .check(&state.pool, state.billing.as_deref(), &auth)
            .await?
    };
    Ok(Json(status))
}

/// 省略時は `public_url` 配下に戻す
#[derive(Deserialize)]
struct RedirectBody {
    #[serde(default)]
    success_url: Option<String>,
    #[serde(default)]
    cancel_url: Option<String>,
    #[serde(default)]
    return_url: Option<String>,
}

async fn checkout(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<RedirectBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let billing = billing(&state)?;
    let email = email(&auth)?;
    let customer = match billing.find_customer(email).await? {
        Some(id) => CheckoutCustomer::Existing(id),
        None => CheckoutCustomer::Email(email.to_string()),
    };
    let base = &state.config.public_url;
    let success_url = body
        .success_url
        .unwrap_or_else(|| format!("{base}/billing?checkout=success"));
    let cancel_url = body
        .cancel_url
        .unwrap_or_else(|| format!("{base}/billing?checkout=cancelled"));
    let url = billing
        .checkout_session(customer, &success_url, &cancel_url)
        .await?;
    // 決済後の再判定で古い結果を返さない
    state.access.invalidate(&auth.user_id).await;
    tracing::info!(user_id = %auth.user_id, "checkout session created");
    Ok(Json(serde_json::json!({ "url": url })))
}

async fn portal(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<RedirectBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let billing = billing(&state)?;
    let mirrored = db::subscriptions::get_subscription(&state.pool, &auth.user_id)
        .await?
        .and_then(|s| s.stripe_customer_id);
    let customer_id = match mirrored {
        Some(id) => id,
        None => billing
            .find_customer(email(&auth)?)
            .await?
            .ok_or_else(|| AppError::NotFound("billing customer".into()))?,
    };
    let return_url = body
        .return_url
        .unwrap_or_else(|| format!("{}/billing", state.config.public_url));
    let url = billing.portal_session(&customer_id, &return_url).await?;
    state.access.invalidate(&auth.user_id).await;
    Ok(Json(serde_json::json!({ "url": url })))
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::{Value, json};

    use super::*;
    use crate::billing::ActiveSubscription;
    use crate::testing::{FakeBilling, TestState, authed, send};

    async fn call(t: &TestState, method: &str, uri: &str) -> (StatusCode, Value) {
        let body = (method == "POST").then(|| json!({}));
        send(t.router(), authed(method, uri, body)).await
    }

    #[tokio::test]
    async fn status_without_provider_uses_trial() {
        let t = TestState::new().await;
        let (status, body) = call(&t, "GET", "/v1/billing/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_access"], true);
        assert_eq!(body["status"], "trial");
        assert_eq!(body["trial_days_left"], 7);
        assert_eq!(body["source"], "mirror");

        let (_, cached) = call(&t, "GET", "/v1/billing/status?optimistic=true").await;
        assert_eq!(cached["status"], "trial");
    }

    #[tokio::test]
    async fn checkout_and_portal_for_subscriber() {
        let mut t = TestState::new().await;
        t.state.billing = Some(Arc::new(FakeBilling::with_subscription(
            "cus_1",
            ActiveSubscription {
                id: "sub_1".into(),
                status: "active".into(),
                current_period_end: Some(Utc::now() + chrono::Duration::days(30)),
            },
        )));

        let (_, body) = call(&t, "GET", "/v1/billing/status").await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["subscribed"], true);

        let (status, body) = call(&t, "POST", "/v1/billing/checkout").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "https://checkout.test/cus_1");

        let (status, body) = call(&t, "POST", "/v1/billing/portal").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "https://portal.test/cus_1");
        assert!(t.state.access.cached(&t.user.user_id).await.is_none());
    }

    #[tokio::test]
    async fn portal_without_customer_is_not_found() {
        let mut t = TestState::new().await;
        t.state.billing = Some(Arc::new(FakeBilling::default()));
        let (status, _) = call(&t, "POST", "/v1/billing/portal").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call(&t, "POST", "/v1/billing/checkout").await;
        assert_eq!(body["url"], "https://checkout.test/new");
    }

    #[tokio::test]
    async fn checkout_without_provider_is_a_config_error() {
        let t = TestState::new().await;
        let (status, _) = call(&t, "POST", "/v1/billing/checkout").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
