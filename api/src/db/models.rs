use serde::Serialize;

use crate::types::{CampaignStatus, ContactStatus, InstanceStatus, MessageStatus};

/// SQLite では TEXT として格納されるため String、
/// PostgreSQL では TIMESTAMPTZ として格納されるため chrono 型を使用。
#[cfg(not(feature = "postgres"))]
pub type Timestamp = String;
#[cfg(feature = "postgres")]
pub type Timestamp = chrono::DateTime<chrono::Utc>;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ContactRow {
    pub id: String,
    pub user_id: String,
    pub phone_number: String,
    pub name: Option<String>,
    #[sqlx(json)]
    pub tags: Vec<String>,
    pub status: String,
    /// `YYYY-MM-DD`
    pub birthday: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ContactRow {
    pub fn status(&self) -> ContactStatus {
        ContactStatus::parse(&self.status).unwrap_or(ContactStatus::Active)
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.status() == ContactStatus::Unsubscribed
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CampaignRow {
    pub id: String,
    pub user_id: String,
    pub instance_id: String,
    pub campaign_name: String,
    pub total_contacts: i64,
    #[sqlx(json)]
    pub message_variations: Vec<String>,
    #[sqlx(json)]
    pub target_tags: Vec<String>,
    pub sent_count: i64,
    pub failed_count: i64,
    pub status: String,
    pub scheduled_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl CampaignRow {
    /// 未知の値は失敗扱いにしてループを止める
    pub fn status(&self) -> CampaignStatus {
        CampaignStatus::parse(&self.status).unwrap_or(CampaignStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MessageLogRow {
    pub id: String,
    pub campaign_id: String,
    pub position: i64,
    pub client_name: String,
    pub client_phone: String,
    pub message: String,
    pub message_variation_index: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub sent_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl MessageLogRow {
    pub fn status(&self) -> MessageStatus {
        MessageStatus::parse(&self.status).unwrap_or(MessageStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InstanceRow {
    pub id: String,
    pub user_id: String,
    pub instance_name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub status: String,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl InstanceRow {
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus::parse(&self.status).unwrap_or(InstanceStatus::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.status() == InstanceStatus::Connected
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub user_id: String,
    /// 課金プロバイダ側の状態 (`trialing`, `active`, `canceled` など)
    pub status: String,
    pub trial_active: bool,
    pub trial_ends_at: Option<Timestamp>,
    pub current_period_end: Option<Timestamp>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
