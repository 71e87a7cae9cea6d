use std::collections::HashMap;

use sqlx::types::Json;
use zapflow_common::import::ImportedContact;
use zapflow_common::merge::MergePlan;
use zapflow_common::phone;

use super::models::ContactRow;
use super::{Db, placeholders, sql, ts};
use crate::types::{ContactId, ContactStatus, UserId};

#[derive(Debug, Clone)]
pub struct NewContact {
    pub phone_number: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub status: ContactStatus,
    pub birthday: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ImportOutcome {
    pub inserted: u64,
    pub updated: u64,
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_contacts(
    pool: &Db,
    user_id: &UserId,
    status: Option<ContactStatus>,
) -> Result<Vec<ContactRow>, sqlx::Error> {
    match status {
        Some(status) => {
            let q = sql(
                "SELECT * FROM contacts WHERE user_id = ? AND status = ? ORDER BY created_at DESC",
            );
            sqlx::query_as::<_, ContactRow>(&q)
                .bind(user_id.as_str())
                .bind(status.as_str())
                .fetch_all(pool)
                .await
        }
        None => {
            let q = sql("SELECT * FROM contacts WHERE user_id = ? ORDER BY created_at DESC");
            sqlx::query_as::<_, ContactRow>(&q)
                .bind(user_id.as_str())
                .fetch_all(pool)
                .await
        }
    }
}

#[tracing::instrument(skip(pool), err)]
pub async fn get_contact(
    pool: &Db,
    user_id: &UserId,
    id: &ContactId,
) -> Result<Option<ContactRow>, sqlx::Error> {
    let q = sql("SELECT * FROM contacts WHERE id = ? AND user_id = ?");
    sqlx::query_as::<_, ContactRow>(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .fetch_optional(pool)
        .await
}

/// 9桁目の有無を区別せずに電話番号で検索する（古い順）。
#[tracing::instrument(skip(pool), err)]
pub async fn find_by_phone(
    pool: &Db,
    user_id: &UserId,
    phone_number: &str,
) -> Result<Vec<ContactRow>, sqlx::Error> {
    let variants = phone::comparison_variants(phone_number);
    if variants.is_empty() {
        return Ok(Vec::new());
    }
    let q = format!(
        "SELECT * FROM contacts WHERE user_id = ? AND phone_number IN ({}) ORDER BY created_at ASC",
        placeholders(variants.len())
    );
    let q = sql(&q);
    let mut query = sqlx::query_as::<_, ContactRow>(&q).bind(user_id.as_str());
    for variant in &variants {
        query = query.bind(variant);
    }
    query.fetch_all(pool).await
}

/// いずれかのタグを持つ有効な連絡先（古い順）
#[tracing::instrument(skip(pool), err)]
pub async fn get_active_by_tags(
    pool: &Db,
    user_id: &UserId,
    tags: &[String],
) -> Result<Vec<ContactRow>, sqlx::Error> {
    let q = sql(
        "SELECT * FROM contacts WHERE user_id = ? AND status = ? ORDER BY created_at ASC, id ASC",
    );
    let contacts = sqlx::query_as::<_, ContactRow>(&q)
        .bind(user_id.as_str())
        .bind(ContactStatus::Active.as_str())
        .fetch_all(pool)
        .await?;
    Ok(contacts
        .into_iter()
        .filter(|c| c.tags.iter().any(|t| tags.contains(t)))
        .collect())
}

#[tracing::instrument(skip(pool, contact), err)]
pub async fn create_contact(
    pool: &Db,
    user_id: &UserId,
    contact: &NewContact,
) -> Result<ContactId, sqlx::Error> {
    let id = ContactId::new_v4();
    let q = sql(
        "INSERT INTO contacts (id, user_id, phone_number, name, tags, status, birthday) VALUES (?, ?, ?, ?, ?, ?, ?)",
    );
    sqlx::query(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .bind(&contact.phone_number)
        .bind(contact.name.as_deref())
        .bind(Json(&contact.tags))
        .bind(contact.status.as_str())
        .bind(contact.birthday.as_deref())
        .execute(pool)
        .await?;
    Ok(id)
}

#[tracing::instrument(skip(pool, contact), err)]
pub async fn update_contact(
    pool: &Db,
    user_id: &UserId,
    id: &ContactId,
    contact: &NewContact,
) -> Result<bool, sqlx::Error> {
    let q = sql(
        "UPDATE contacts SET phone_number = ?, name = ?, tags = ?, status = ?, birthday = ?, updated_at = ? WHERE id = ? AND user_id = ?",
    );
    let result = sqlx::query(&q)
        .bind(&contact.phone_number)
        .bind(contact.name.as_deref())
        .bind(Json(&contact.tags))
        .bind(contact.status.as_str())
        .bind(contact.birthday.as_deref())
        .bind(ts(chrono::Utc::now()))
        .bind(id.as_str())
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[tracing::instrument(skip(pool), err)]
pub async fn delete_contact(
    pool: &Db,
    user_id: &UserId,
    id: &ContactId,
) -> Result<bool, sqlx::Error> {
    let q = sql("DELETE FROM contacts WHERE id = ? AND user_id = ?");
    let result = sqlx::query(&q)
        .bind(id.as_str())
        .bind(user_id.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 電話番号に一致する連絡先をすべて配信停止にする。該当がなければ新規に作成する。
/// 戻り値は更新（または作成）した行数。
#[tracing::instrument(skip(pool), err)]
pub async fn unsubscribe_phone(
    pool: &Db,
    user_id: &UserId,
    phone_number: &str,
) -> Result<u64, sqlx::Error> {
    let variants = phone::comparison_variants(phone_number);
    let q = format!(
        "UPDATE contacts SET status = ?, updated_at = ? WHERE user_id = ? AND phone_number IN ({})",
        placeholders(variants.len())
    );
    let q = sql(&q);
    let mut query = sqlx::query(&q)
        .bind(ContactStatus::Unsubscribed.as_str())
        .bind(ts(chrono::Utc::now()))
        .bind(user_id.as_str());
    for variant in &variants {
        query = query.bind(variant);
    }
    let updated = query.execute(pool).await?.rows_affected();
    if updated > 0 {
        return Ok(updated);
    }

    create_contact(
        pool,
        user_id,
        &NewContact {
            phone_number: phone::digits(phone::strip_jid(phone_number)),
            name: None,
            tags: Vec::new(),
            status: ContactStatus::Unsubscribed,
            birthday: None,
        },
    )
    .await?;
    Ok(1)
}

/// 取り込み。既存の番号（比較キー一致）はタグを追加し、名前・誕生日が空なら補完する。
#[tracing::instrument(skip(pool, contacts), fields(count = contacts.len()), err)]
pub async fn import_contacts(
    pool: &Db,
    user_id: &UserId,
    contacts: &[ImportedContact],
) -> Result<ImportOutcome, sqlx::Error> {
    let existing = get_contacts(pool, user_id, None).await?;
    let mut by_key: HashMap<String, ContactRow> = HashMap::new();
    // 古いものを優先する
    for row in existing.into_iter().rev() {
        by_key
            .entry(phone::normalize_for_comparison(&row.phone_number))
            .or_insert(row);
    }

    let mut outcome = ImportOutcome::default();
    let mut tx = pool.begin().await?;
    let now = ts(chrono::Utc::now());
    for contact in contacts {
        let birthday = contact.birthday.map(|d| d.format("%Y-%m-%d").to_string());
        let key = phone::normalize_for_comparison(&contact.phone);
        match by_key.get(&key) {
            Some(row) => {
                let mut tags = row.tags.clone();
                for tag in &contact.tags {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
                let q = sql(
                    "UPDATE contacts SET name = COALESCE(name, ?), tags = ?, birthday = COALESCE(birthday, ?), updated_at = ? WHERE id = ?",
                );
                sqlx::query(&q)
                    .bind(contact.name.as_deref())
                    .bind(Json(&tags))
                    .bind(birthday.as_deref())
                    .bind(&now)
                    .bind(&row.id)
                    .execute(&mut *tx)
                    .await?;
                outcome.updated += 1;
            }
            None => {
                let q = sql(
                    "INSERT INTO contacts (id, user_id, phone_number, name, tags, status, birthday) VALUES (?, ?, ?, ?, ?, ?, ?)",
                );
                sqlx::query(&q)
                    .bind(ContactId::new_v4().as_str())
                    .bind(user_id.as_str())
                    .bind(&contact.phone)
                    .bind(contact.name.as_deref())
                    .bind(Json(&contact.tags))
                    .bind(ContactStatus::Active.as_str())
                    .bind(birthday.as_deref())
                    .execute(&mut *tx)
                    .await?;
                outcome.inserted += 1;
            }
        }
    }
    tx.commit().await?;
    Ok(outcome)
}

/// 統合計画を1トランザクションで適用する。戻り値は削除した行数。
#[tracing::instrument(skip(pool, plans), fields(groups = plans.len()), err)]
pub async fn apply_merges(
    pool: &Db,
    user_id: &UserId,
    plans: &[MergePlan],
) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = ts(chrono::Utc::now());
    let mut deleted = 0;
    for plan in plans {
        let q = sql("UPDATE contacts SET tags = ?, updated_at = ? WHERE id = ? AND user_id = ?");
        sqlx::query(&q)
            .bind(Json(&plan.tags))
            .bind(&now)
            .bind(&plan.keep)
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await?;
        for id in &plan.remove {
            let q = sql("DELETE FROM contacts WHERE id = ? AND user_id = ?");
            deleted += sqlx::query(&q)
                .bind(id)
                .bind(user_id.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
    }
    tx.commit().await?;
    Ok(deleted)
}
