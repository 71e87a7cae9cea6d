use super::models::MessageLogRow;
use super::{Db, sql, ts};
use crate::types::{CampaignId, MessageLogId, MessageStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub sent: i64,
    pub failed: i64,
    pub blocked: i64,
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_logs(
    pool: &Db,
    campaign_id: &CampaignId,
) -> Result<Vec<MessageLogRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_logs WHERE campaign_id = ? ORDER BY position ASC");
    sqlx::query_as::<_, MessageLogRow>(&q)
        .bind(campaign_id.as_str())
        .fetch_all(pool)
        .await
}

/// 未処理のログを受信者リストの順で返す（中断後の再開にも使う）。
#[tracing::instrument(skip(pool), err)]
pub async fn get_pending(
    pool: &Db,
    campaign_id: &CampaignId,
) -> Result<Vec<MessageLogRow>, sqlx::Error> {
    let q = sql(
        "SELECT * FROM message_logs WHERE campaign_id = ? AND status = ? ORDER BY position ASC",
    );
    sqlx::query_as::<_, MessageLogRow>(&q)
        .bind(campaign_id.as_str())
        .bind(MessageStatus::Pending.as_str())
        .fetch_all(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_log(pool: &Db, id: &MessageLogId) -> Result<Option<MessageLogRow>, sqlx::Error> {
    let q = sql("SELECT * FROM message_logs WHERE id = ?");
    sqlx::query_as::<_, MessageLogRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

/// pending のログだけを確定させる。すでに確定済みなら false。
async fn resolve(
    pool: &Db,
    id: &MessageLogId,
    status: MessageStatus,
    error_message: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let sent_at = (status == MessageStatus::Sent).then(|| ts(chrono::Utc::now()));
    let q = sql(
        "UPDATE message_logs SET status = ?, error_message = ?, sent_at = ? WHERE id = ? AND status = ?",
    );
    let result = sqlx::query(&q)
        .bind(status.as_str())
        .bind(error_message)
        .bind(sent_at)
        .bind(id.as_str())
        .bind(MessageStatus::Pending.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn mark_sent(pool: &Db, id: &MessageLogId) -> Result<bool, sqlx::Error> {
    resolve(pool, id, MessageStatus::Sent, None).await
}

#[tracing::instrument(skip(pool), err)]
pub async fn mark_failed(
    pool: &Db,
    id: &MessageLogId,
    error_message: &str,
) -> Result<bool, sqlx::Error> {
    resolve(pool, id, MessageStatus::Failed, Some(error_message)).await
}

#[tracing::instrument(skip(pool), err)]
pub async fn mark_blocked(pool: &Db, id: &MessageLogId) -> Result<bool, sqlx::Error> {
    resolve(pool, id, MessageStatus::Blocked, None).await
}

#[tracing::instrument(skip(pool), err)]
pub async fn count_by_status(
    pool: &Db,
    campaign_id: &CampaignId,
) -> Result<StatusCounts, sqlx::Error> {
    let q = sql("SELECT status, COUNT(*) FROM message_logs WHERE campaign_id = ? GROUP BY status");
    let rows: Vec<(String, i64)> = sqlx::query_as(&q)
        .bind(campaign_id.as_str())
        .fetch_all(pool)
        .await?;
    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        match MessageStatus::parse(&status) {
            Some(MessageStatus::Pending) => counts.pending = n,
            Some(MessageStatus::Sent) => counts.sent = n,
            Some(MessageStatus::Failed) => counts.failed = n,
            Some(MessageStatus::Blocked) => counts.blocked = n,
            None => tracing::warn!(%status, "unknown message log status"),
        }
    }
    Ok(counts)
}
