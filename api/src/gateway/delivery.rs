use async_trait::async_trait;
use serde::Serialize;

/// 中継 webhook に渡す1通分のリクエスト
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub instance_name: String,
    #[serde(rename = "api_key")]
    pub api_key: String,
    pub number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// base64 エンコードされた画像
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// WhatsApp への実配信を担う外部ゲートウェイ。
/// 失敗時はメッセージログにそのまま記録される文言を返す。
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), String>;
}

pub struct WebhookDelivery {
    client: reqwest::Client,
    url: String,
}

impl WebhookDelivery {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl DeliveryGateway for WebhookDelivery {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), String> {
        let resp = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!(number = %message.number, "delivery webhook returned {status}: {body}");
            return Err(super::http_status_error(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_uses_relay_field_names() {
        let msg = OutgoingMessage {
            instance_name: "zf_abc".into(),
            api_key: "key".into(),
            number: "5565999852826".into(),
            text: Some("Oi Ana".into()),
            image: None,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "instanceName": "zf_abc",
                "api_key": "key",
                "number": "5565999852826",
                "text": "Oi Ana",
            })
        );
    }

    #[test]
    fn status_error_text() {
        assert_eq!(
            crate::gateway::http_status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            "HTTP 500"
        );
    }
}
