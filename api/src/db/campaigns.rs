use chrono::{DateTime, Utc};
use sqlx::types::Json;

use super::contacts::NewContact;
use super::models::CampaignRow;
use super::{Db, placeholders, sql, ts};
use crate::types::{
    CampaignId, CampaignStatus, ContactId, InstanceId, MessageLogId, MessageStatus, UserId,
};

#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub user_id: UserId,
    pub instance_id: InstanceId,
    pub campaign_name: String,
    pub message_variations: Vec<String>,
    pub target_tags: Vec<String>,
    pub status: CampaignStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub position: i64,
    pub client_name: String,
    pub client_phone: String,
    pub message: String,
    pub message_variation_index: i64,
    pub status: MessageStatus,
}

/// キャンペーン・送信ログ・新規連絡先を1トランザクションで作る。
/// `total_contacts` はログの件数になる。
#[tracing::instrument(skip(pool, campaign, logs, new_contacts), fields(logs = logs.len(), new_contacts = new_contacts.len()), err)]
pub async fn create_campaign_with_logs(
    pool: &Db,
    campaign: &NewCampaign,
    logs: &[NewMessageLog],
    new_contacts: &[NewContact],
) -> Result<CampaignId, sqlx::Error> {
    let id = CampaignId::new_v4();
    let mut tx = pool.begin().await?;

    let q = sql(
        "INSERT INTO contacts (id, user_id, phone_number, name, tags, status, birthday) VALUES (?, ?, ?, ?, ?, ?, ?)",
    );
    for contact in new_contacts {
        sqlx::query(&q)
            .bind(ContactId::new_v4().as_str())
            .bind(campaign.user_id.as_str())
            .bind(&contact.phone_number)
            .bind(contact.name.as_deref())
            .bind(Json(&contact.tags))
            .bind(contact.status.as_str())
            .bind(contact.birthday.as_deref())
            .execute(&mut *tx)
            .await?;
    }

    let q = sql(
        "INSERT INTO message_campaigns (id, user_id, instance_id, campaign_name, total_contacts, message_variations, target_tags, status, scheduled_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(campaign.user_id.as_str())
        .bind(campaign.instance_id.as_str())
        .bind(&campaign.campaign_name)
        .bind(logs.len() as i64)
        .bind(Json(&campaign.message_variations))
        .bind(Json(&campaign.target_tags))
        .bind(campaign.status.as_str())
        .bind(campaign.scheduled_at.map(ts))
        .execute(&mut *tx)
        .await?;

    let q = sql(
        "INSERT INTO message_logs (id, campaign_id, position, client_name, client_phone, message, message_variation_index, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    );
    for log in logs {
        sqlx::query(&q)
            .bind(MessageLogId::new_v4().as_str())
            .bind(id.as_str())
            .bind(log.position)
            .bind(&log.client_name)
            .bind(&log.client_phone)
            .bind(&log.message)
            .bind(log.message_variation_index)
            .bind(log.status.as_str())
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(id)
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_campaign(pool: &Db, id: &CampaignId) -> Result<Option<CampaignRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_campaigns WHERE id = ?");
    sqlx::query_as::<_, CampaignRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_campaign_for_user(
    pool: &Db,
    user_id: &UserId,
    id: &CampaignId,
) -> Result<Option<CampaignRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_campaigns WHERE id = ? AND user_id = ?");
    sqlx::query_as::<_, CampaignRow>(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_campaigns(pool: &Db, user_id: &UserId) -> Result<Vec<CampaignRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_campaigns WHERE user_id = ? ORDER BY created_at DESC");
    sqlx::query_as::<_, CampaignRow>(&q)
        .bind(user_id.as_str())
        .fetch_all(pool)
        .await
}

/// 実行時刻を過ぎた予約キャンペーン
#[tracing::instrument(skip(pool), err)]
pub async fn get_due_scheduled(
    pool: &Db,
    now: DateTime<Utc>,
) -> Result<Vec<CampaignRow>, sqlx::Error> {
    let q = sql(
        "SELECT * FROM message_campaigns WHERE status = ? AND scheduled_at IS NOT NULL AND scheduled_at <= ?
         ORDER BY scheduled_at ASC",
    );
    sqlx::query_as::<_, CampaignRow>(&q)
        .bind(CampaignStatus::Scheduled.as_str())
        .bind(ts(now))
        .fetch_all(pool)
        .await
}

/// 許可された遷移元にある場合のみ状態を更新する。終端状態では `completed_at` を記録する。
/// 更新できなければ false（別の主体が先に遷移させた）。
#[tracing::instrument(skip(pool), err)]
pub async fn transition(
    pool: &Db,
    id: &CampaignId,
    to: CampaignStatus,
) -> Result<bool, sqlx::Error> {
    let sources = to.allowed_sources();
    if sources.is_empty() {
        return Ok(false);
    }
    let q = format!(
        "UPDATE message_campaigns SET status = ?, completed_at = COALESCE(?, completed_at)
         WHERE id = ? AND status IN ({})",
        placeholders(sources.len())
    );
    let q = sql(&q);
    let completed_at = to.is_terminal().then(|| ts(Utc::now()));
    let mut query = sqlx::query(&q)
        .bind(to.as_str())
        .bind(completed_at)
        .bind(id.as_str());
    for source in sources {
        query = query.bind(source.as_str());
    }
    let result = query.execute(pool).await?;
    if result.rows_affected() > 0 {
        tracing::info!(campaign_id = %id, status = %to, "campaign status changed");
    }
    Ok(result.rows_affected() > 0)
}

/// 送信成功数を1増やす。読み出し→書き込みではなく UPDATE 文の中で加算し、
/// `sent_count + failed_count <= total_contacts` を超える加算は行わない。
#[tracing::instrument(skip(pool), err)]
pub async fn increment_sent(pool: &Db, id: &CampaignId) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE message_campaigns SET sent_count = sent_count + 1
         WHERE id = ? AND sent_count + failed_count < total_contacts",
    );
    let result = sqlx::query(&q).bind(id.as_str()).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn increment_failed(pool: &Db, id: &CampaignId) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE message_campaigns SET failed_count = failed_count + 1
         WHERE id = ? AND sent_count + failed_count < total_contacts",
    );
    let result = sqlx::query(&q).bind(id.as_str()).execute(pool).await?;
    Ok(result.rows_affected() > 0)
}
