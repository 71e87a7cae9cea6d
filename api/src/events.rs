//! キャンペーンの変更通知。
//!
//! 送信ループやコールバックが状態を変えるたびに発行し、購読者はキャンペーンIDで絞り込む。
//! データベース固有の通知機構には依存しない。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::{CampaignId, CampaignStatus, MessageStatus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CampaignEvent {
    CampaignUpdated {
        campaign_id: CampaignId,
        status: CampaignStatus,
        sent_count: i64,
        failed_count: i64,
    },
    MessageUpdated {
        campaign_id: CampaignId,
        log_id: String,
        status: MessageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CampaignEvent {
    pub fn campaign_id(&self) -> &CampaignId {
        match self {
            Self::CampaignUpdated { campaign_id, .. } | Self::MessageUpdated { campaign_id, .. } => {
                campaign_id
            }
        }
    }
}

#[derive(Clone)]
pub struct CampaignEvents {
    tx: broadcast::Sender<CampaignEvent>,
}

impl Default for CampaignEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 購読者がいなくても失敗扱いにしない
    pub fn publish(&self, event: CampaignEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self, campaign_id: CampaignId) -> CampaignSubscription {
        CampaignSubscription {
            campaign_id,
            rx: self.tx.subscribe(),
        }
    }
}

pub struct CampaignSubscription {
    campaign_id: CampaignId,
    rx: broadcast::Receiver<CampaignEvent>,
}

impl CampaignSubscription {
    /// 対象キャンペーンの次のイベント。発行側がすべて破棄されたら `None`。
    /// 取りこぼし（Lagged）は読み飛ばして続行する。
    pub async fn next(&mut self) -> Option<CampaignEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.campaign_id() == &self.campaign_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, campaign_id = %self.campaign_id, "event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
