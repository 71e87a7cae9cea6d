use std::collections::HashSet;

use serde::Deserialize;
use zapflow_common::phone;

use crate::db::{self, Db};
use crate::error::AppError;
use crate::gateway::instance::InstanceGateway;
use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RecipientInput {
    #[serde(default)]
    pub name: Option<String>,
    pub phone: String,
}

/// 送信先の指定方法
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientSource {
    Explicit { recipients: Vec<RecipientInput> },
    Tags { tags: Vec<String> },
    Group { group_id: String },
}

impl RecipientSource {
    pub fn target_tags(&self) -> Vec<String> {
        match self {
            Self::Tags { tags } => tags.clone(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: Option<String>,
    pub phone: String,
    /// タグ指定で連絡先から選ばれた受信者（連絡先を新規作成しない）
    pub tag_sourced: bool,
}

/// 指定方法に応じて受信者列を解決する。比較キーが同じ番号は最初の1件だけ残す。
pub async fn resolve(
    pool: &Db,
    instances: Option<&dyn InstanceGateway>,
    user_id: &UserId,
    instance_name: Option<&str>,
    source: &RecipientSource,
) -> Result<Vec<Recipient>, AppError> {
    let recipients = match source {
        RecipientSource::Explicit { recipients } => recipients
            .iter()
            .map(|r| Recipient {
                name: r.name.clone().filter(|n| !n.trim().is_empty()),
                phone: r.phone.clone(),
                tag_sourced: false,
            })
            .collect(),
        RecipientSource::Tags { tags } => {
            if tags.is_empty() {
                return Err(AppError::PreconditionFailed(
                    "at least one tag is required".into(),
                ));
            }
            db::contacts::get_active_by_tags(pool, user_id, tags)
                .await?
                .into_iter()
                .map(|c| Recipient {
                    name: c.name,
                    phone: c.phone_number,
                    tag_sourced: true,
                })
                .collect()
        }
        RecipientSource::Group { group_id } => {
            let gateway = instances
                .ok_or_else(|| AppError::Config("WhatsApp gateway API is not configured".into()))?;
            let instance_name = instance_name
                .ok_or_else(|| AppError::PreconditionFailed("WhatsApp not connected".into()))?;
            let group = gateway
                .fetch_groups(instance_name)
                .await?
                .into_iter()
                .find(|g| &g.id == group_id)
                .ok_or_else(|| AppError::NotFound(format!("group {group_id}")))?;
            group
                .participants
                .into_iter()
                .map(|phone| Recipient {
                    name: None,
                    phone,
                    tag_sourced: false,
                })
                .collect()
        }
    };
    Ok(dedupe(recipients))
}

pub fn dedupe(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(phone::normalize_for_comparison(&r.phone)))
        .collect()
}
