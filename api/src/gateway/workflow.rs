use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMedia {
    pub base64: String,
    pub mimetype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchContact {
    pub log_id: String,
    pub name: String,
    pub phone: String,
    pub message: String,
}

/// 予約キャンペーン1件分をワークフローエンジンへ渡す webhook ペイロード。
/// エンジンは1通ごとに `callback_url` を呼び、バッチの合間に `status_url` を確認する。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignBatch {
    pub campaign_id: String,
    pub instance_name: String,
    pub api_key: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<BatchMedia>,
    pub contacts: Vec<BatchContact>,
    pub callback_url: String,
    pub status_url: String,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn dispatch(&self, batch: &CampaignBatch) -> Result<(), String>;
}

pub struct WebhookWorkflow {
    client: reqwest::Client,
    url: String,
    /// エンジンがコールバック時に `x-callback-secret` として返す値
    callback_secret: Option<String>,
}

impl WebhookWorkflow {
    pub fn new(url: impl Into<String>, callback_secret: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            callback_secret,
        }
    }
}

#[async_trait]
impl WorkflowEngine for WebhookWorkflow {
    async fn dispatch(&self, batch: &CampaignBatch) -> Result<(), String> {
        let mut req = self.client.post(&self.url).json(batch);
        if let Some(secret) = &self.callback_secret {
            req = req.header("x-callback-secret", secret);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(super::http_status_error(resp.status()));
        }
        Ok(())
    }
}
