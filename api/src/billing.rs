//! 課金プロバイダ（Stripe）との連携。
//!
//! アクセス判定に必要な問い合わせと、チェックアウト／カスタマーポータルの
//! セッション作成だけを扱う。Stripe の REST API はフォームエンコードで呼び出す。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSubscription {
    pub id: String,
    pub status: String,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// チェックアウト対象の顧客。既存顧客がいなければメールアドレスで作らせる。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutCustomer {
    Existing(String),
    Email(String),
}

#[async_trait]
pub trait BillingProvider: Send + Sync {
    async fn find_customer(&self, email: &str) -> Result<Option<String>, AppError>;
    async fn active_subscription(
        &self,
        customer_id: &str,
    ) -> Result<Option<ActiveSubscription>, AppError>;
    /// 決済ページの URL を返す
    async fn checkout_session(
        &self,
        customer: CheckoutCustomer,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, AppError>;
    async fn portal_session(&self, customer_id: &str, return_url: &str)
    -> Result<String, AppError>;
}

pub struct StripeClient {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
    price_id: Option<String>,
}

impl StripeClient {
    /// 秘密鍵が設定されていなければ `None`
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        let secret_key = config.stripe_secret_key.clone()?;
        Some(Self {
            client: reqwest::Client::new(),
            api_base: config.stripe_api_base.trim_end_matches('/').to_string(),
            secret_key,
            price_id: config.stripe_price_id.clone(),
        })
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, AppError> {
        let resp = req
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("billing request failed: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("invalid billing response: {e}")))?;
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(AppError::BadGateway(format!(
                "billing provider returned {status}: {message}"
            )));
        }
        Ok(body)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }
}

#[async_trait]
impl BillingProvider for StripeClient {
    async fn find_customer(&self, email: &str) -> Result<Option<String>, AppError> {
        let body = self
            .send(
                self.client
                    .get(self.url("customers"))
                    .query(&[("email", email), ("limit", "1")]),
            )
            .await?;
        Ok(body["data"][0]["id"].as_str().map(str::to_string))
    }

    async fn active_subscription(
        &self,
        customer_id: &str,
    ) -> Result<Option<ActiveSubscription>, AppError> {
        let body = self
            .send(self.client.get(self.url("subscriptions")).query(&[
                ("customer", customer_id),
                ("status", "active"),
                ("limit", "1"),
            ]))
            .await?;
        Ok(parse_subscription(&body["data"][0]))
    }

    async fn checkout_session(
        &self,
        customer: CheckoutCustomer,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, AppError> {
        let price_id = self
            .price_id
            .as_deref()
            .ok_or_else(|| AppError::Config("STRIPE_PRICE_ID is not set".into()))?;
        let mut form = vec![
            ("mode", "subscription".to_string()),
            ("line_items[0][price]", price_id.to_string()),
            ("line_items[0][quantity]", "1".to_string()),
            ("success_url", success_url.to_string()),
            ("cancel_url", cancel_url.to_string()),
        ];
        match customer {
            CheckoutCustomer::Existing(id) => form.push(("customer", id)),
            CheckoutCustomer::Email(email) => form.push(("customer_email", email)),
        }
        let body = self
            .send(self.client.post(self.url("checkout/sessions")).form(&form))
            .await?;
        session_url(&body)
    }

    async fn portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> Result<String, AppError> {
        let body = self
            .send(
                self.client
                    .post(self.url("billing_portal/sessions"))
                    .form(&[("customer", customer_id), ("return_url", return_url)]),
            )
            .await?;
        session_url(&body)
    }
}

fn session_url(body: &Value) -> Result<String, AppError> {
    body["url"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| AppError::BadGateway("billing session has no url".into()))
}

/// 新しい API バージョンでは期間終了がアイテム側にしかない
fn parse_subscription(value: &Value) -> Option<ActiveSubscription> {
    let id = value["id"].as_str()?.to_string();
    let period_end = value["current_period_end"]
        .as_i64()
        .or_else(|| value["items"]["data"][0]["current_period_end"].as_i64());
    Some(ActiveSubscription {
        id,
        status: value["status"].as_str().unwrap_or("active").to_string(),
        current_period_end: period_end.and_then(|secs| DateTime::from_timestamp(secs, 0)),
    })
}
