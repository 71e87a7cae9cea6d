use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use zapflow_common::phone;

use crate::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    /// インスタンス固有の API キー（配信リクエストに同梱する）
    pub api_key: String,
    pub qr_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Open,
    Connecting,
    Close,
}

impl ConnectionState {
    pub fn parse(s: &str) -> Self {
        match s {
            "open" => Self::Open,
            "connecting" => Self::Connecting,
            _ => Self::Close,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhatsAppGroup {
    pub id: String,
    pub subject: String,
    /// 参加者の電話番号（数字のみ）
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WhatsAppContact {
    pub phone: String,
    pub name: Option<String>,
}

/// WhatsApp ゲートウェイのインスタンス管理 API（接続・QR・状態・グループ・連絡先）。
#[async_trait]
pub trait InstanceGateway: Send + Sync {
    async fn create_instance(&self, instance_name: &str) -> Result<CreatedInstance, AppError>;
    /// 新しい QR コードを発行する
    async fn connect(&self, instance_name: &str) -> Result<Option<String>, AppError>;
    async fn connection_state(&self, instance_name: &str) -> Result<ConnectionState, AppError>;
    async fn owner_phone(&self, instance_name: &str) -> Result<Option<String>, AppError>;
    async fn logout(&self, instance_name: &str) -> Result<(), AppError>;
    async fn fetch_groups(&self, instance_name: &str) -> Result<Vec<WhatsAppGroup>, AppError>;
    async fn fetch_contacts(&self, instance_name: &str) -> Result<Vec<WhatsAppContact>, AppError>;
}

pub struct EvolutionGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl EvolutionGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<Value, AppError> {
        let resp = req
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("gateway request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::BadGateway(format!(
                "gateway returned {status}: {body}"
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| AppError::BadGateway(format!("invalid gateway response: {e}")))
    }
}

#[async_trait]
impl InstanceGateway for EvolutionGateway {
    async fn create_instance(&self, instance_name: &str) -> Result<CreatedInstance, AppError> {
        let body = serde_json::json!({
            "instanceName": instance_name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        let value = self
            .send(self.client.post(self.url("instance/create")).json(&body))
            .await?;
        parse_created(&value)
            .ok_or_else(|| AppError::BadGateway("gateway did not return an instance key".into()))
    }

    async fn connect(&self, instance_name: &str) -> Result<Option<String>, AppError> {
        let name = urlencoding::encode(instance_name);
        let value = self
            .send(self.client.get(self.url(&format!("instance/connect/{name}"))))
            .await?;
        Ok(value["base64"].as_str().map(str::to_string))
    }

    async fn connection_state(&self, instance_name: &str) -> Result<ConnectionState, AppError> {
        let name = urlencoding::encode(instance_name);
        let value = self
            .send(
                self.client
                    .get(self.url(&format!("instance/connectionState/{name}"))),
            )
            .await?;
        Ok(parse_state(&value))
    }

    async fn owner_phone(&self, instance_name: &str) -> Result<Option<String>, AppError> {
        let value = self
            .send(
                self.client
                    .get(self.url("instance/fetchInstances"))
                    .query(&[("instanceName", instance_name)]),
            )
            .await?;
        Ok(parse_owner(&value))
    }

    async fn logout(&self, instance_name: &str) -> Result<(), AppError> {
        let name = urlencoding::encode(instance_name);
        self.send(self.client.delete(self.url(&format!("instance/logout/{name}"))))
            .await?;
        Ok(())
    }

    async fn fetch_groups(&self, instance_name: &str) -> Result<Vec<WhatsAppGroup>, AppError> {
        let name = urlencoding::encode(instance_name);
        let value = self
            .send(
                self.client
                    .get(self.url(&format!("group/fetchAllGroups/{name}")))
                    .query(&[("getParticipants", "true")]),
            )
            .await?;
        Ok(parse_groups(&value))
    }

    async fn fetch_contacts(&self, instance_name: &str) -> Result<Vec<WhatsAppContact>, AppError> {
        let name = urlencoding::encode(instance_name);
        let value = self
            .send(
                self.client
                    .post(self.url(&format!("chat/findContacts/{name}")))
                    .json(&serde_json::json!({})),
            )
            .await?;
        Ok(parse_contacts(&value))
    }
}

/// `hash` は文字列の場合と `{ "apikey": ... }` の場合がある
fn parse_created(value: &Value) -> Option<CreatedInstance> {
    let api_key = value["hash"]
        .as_str()
        .or_else(|| value["hash"]["apikey"].as_str())?
        .to_string();
    let qr_code = value["qrcode"]["base64"].as_str().map(str::to_string);
    Some(CreatedInstance { api_key, qr_code })
}

fn parse_state(value: &Value) -> ConnectionState {
    let state = value["instance"]["state"]
        .as_str()
        .or_else(|| value["state"].as_str())
        .unwrap_or("close");
    ConnectionState::parse(state)
}

fn parse_owner(value: &Value) -> Option<String> {
    let first = value.as_array()?.first()?;
    let jid = first["ownerJid"]
        .as_str()
        .or_else(|| first["instance"]["owner"].as_str())?;
    let digits = phone::digits(phone::strip_jid(jid));
    (!digits.is_empty()).then_some(digits)
}

/// 電話番号として解釈できない参加者（`@lid` など）は除く
fn participant_phone(jid: &str) -> Option<String> {
    if !jid.ends_with("@s.whatsapp.net") && !jid.ends_with("@c.us") {
        return None;
    }
    phone::validate(jid).ok()
}

fn parse_groups(value: &Value) -> Vec<WhatsAppGroup> {
    let Some(groups) = value.as_array() else {
        return Vec::new();
    };
    groups
        .iter()
        .filter_map(|g| {
            let id = g["id"].as_str()?.to_string();
            let participants = g["participants"]
                .as_array()
                .map(|ps| {
                    ps.iter()
                        .filter_map(|p| p["id"].as_str().and_then(participant_phone))
                        .collect()
                })
                .unwrap_or_default();
            Some(WhatsAppGroup {
                subject: g["subject"].as_str().unwrap_or(&id).to_string(),
                id,
                participants,
            })
        })
        .collect()
}

fn parse_contacts(value: &Value) -> Vec<WhatsAppContact> {
    let Some(contacts) = value.as_array() else {
        return Vec::new();
    };
    contacts
        .iter()
        .filter_map(|c| {
            let jid = c["remoteJid"].as_str().or_else(|| c["id"].as_str())?;
            let phone = participant_phone(jid)?;
            let name = c["pushName"]
                .as_str()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            Some(WhatsAppContact { phone, name })
        })
        .collect()
}
