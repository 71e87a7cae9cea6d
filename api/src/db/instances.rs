use super::models::InstanceRow;
use super::{Db, sql, ts};
use crate::types::{InstanceId, InstanceStatus, UserId};

#[tracing::instrument(skip(pool), err)]
pub async fn get_instance_for_user(
    pool: &Db,
    user_id: &UserId,
) -> Result<Option<InstanceRow>, sqlx::Error> {
    let q = sql("SELECT * FROM whatsapp_instances WHERE user_id = ?");
    sqlx::query_as::<_, InstanceRow>(&q)
        .bind(user_id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_instance(
    pool: &Db,
    id: &InstanceId,
) -> Result<Option<InstanceRow>, sqlx::Error> {
    let q = sql("SELECT * FROM whatsapp_instances WHERE id = ?");
    sqlx::query_as::<_, InstanceRow>(&q)
        .bind(id.as_str())
        .fetch_optional(pool)
        .await
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_instance_by_name(
    pool: &Db,
    instance_name: &str,
) -> Result<Option<InstanceRow>, sqlx::Error> {
    let q = sql("SELECT * FROM whatsapp_instances WHERE instance_name = ?");
    sqlx::query_as::<_, InstanceRow>(&q)
        .bind(instance_name)
        .fetch_optional(pool)
        .await
}

/// ユーザごとに1インスタンス。既存行があれば名前・キー・QRを置き換えて pending に戻す。
#[tracing::instrument(skip(pool, api_key, qr_code), err)]
pub async fn upsert_pending_instance(
    pool: &Db,
    user_id: &UserId,
    instance_name: &str,
    api_key: &str,
    qr_code: Option<&str>,
) -> Result<InstanceId, sqlx::Error> {
    let id = InstanceId::new_v4();
    let q = sql(
        "INSERT INTO whatsapp_instances (id, user_id, instance_name, api_key, status, qr_code) VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (user_id) DO UPDATE SET instance_name = excluded.instance_name, api_key = excluded.api_key,
         status = excluded.status, qr_code = excluded.qr_code, updated_at = ?",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .bind(instance_name)
        .bind(api_key)
        .bind(InstanceStatus::Pending.as_str())
        .bind(qr_code)
        .bind(ts(chrono::Utc::now()))
        .execute(pool)
        .await?;

    // 競合時は既存の id が残る
    let row = get_instance_for_user(pool, user_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    Ok(InstanceId(row.id))
}

#[tracing::instrument(skip(pool, qr_code), err)]
pub async fn update_qr_code(
    pool: &Db,
    id: &InstanceId,
    qr_code: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let q = sql("UPDATE whatsapp_instances SET qr_code = ?, status = ?, updated_at = ? WHERE id = ?");
    let result = sqlx::query(&q)
        .bind(qr_code)
        .bind(InstanceStatus::Pending.as_str())
        .bind(ts(chrono::Utc::now()))
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 接続状態を更新する。接続済み・切断時は QR を破棄する。
#[tracing::instrument(skip(pool), err)]
pub async fn update_status(
    pool: &Db,
    id: &InstanceId,
    status: InstanceStatus,
    phone_number: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE whatsapp_instances SET status = ?, phone_number = COALESCE(?, phone_number),
         qr_code = CASE WHEN ? = 'pending' THEN qr_code ELSE NULL END, updated_at = ? WHERE id = ?",
    );
    let result = sqlx::query(&q)
        .bind(status.as_str())
        .bind(phone_number)
        .bind(status.as_str())
        .bind(ts(chrono::Utc::now()))
        .bind(id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
