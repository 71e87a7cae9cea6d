pub mod campaigns;
pub mod contacts;
pub mod instances;
pub mod message_logs;
pub mod models;
pub mod subscriptions;

use chrono::{DateTime, Utc};

#[cfg(not(feature = "postgres"))]
pub type Db = sqlx::SqlitePool;
#[cfg(feature = "postgres")]
pub type Db = sqlx::PgPool;

/// `?` プレースホルダを PostgreSQL の `$1, $2, ...` に変換する。
/// SQLite ビルドではそのまま返す。
#[cfg(not(feature = "postgres"))]
pub(crate) fn sql(query: &str) -> std::borrow::Cow<'_, str> {
    std::borrow::Cow::Borrowed(query)
}

#[cfg(feature = "postgres")]
pub(crate) fn sql(query: &str) -> std::borrow::Cow<'_, str> {
    use std::fmt::Write;
    let mut result = String::with_capacity(query.len() + 16);
    let mut idx = 0u32;
    let mut in_literal = false;
    for ch in query.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                result.push(ch);
            }
            '?' if !in_literal => {
                idx += 1;
                let _ = write!(result, "${idx}");
            }
            _ => result.push(ch),
        }
    }
    std::borrow::Cow::Owned(result)
}

/// `IN (?, ?, ...)` 用のプレースホルダ列
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n.max(1)].join(", ")
}

/// 日時のバインド値。SQLite では辞書順比較できる RFC 3339 (ミリ秒, `Z`) 文字列にする。
#[cfg(not(feature = "postgres"))]
pub(crate) type TimestampBind = String;
#[cfg(feature = "postgres")]
pub(crate) type TimestampBind = DateTime<Utc>;

#[cfg(not(feature = "postgres"))]
pub(crate) fn ts(at: DateTime<Utc>) -> TimestampBind {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}
#[cfg(feature = "postgres")]
pub(crate) fn ts(at: DateTime<Utc>) -> TimestampBind {
    at
}

/// 行から読み出した日時を `DateTime<Utc>` に戻す。
#[cfg(not(feature = "postgres"))]
pub fn parse_ts(value: &models::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
#[cfg(feature = "postgres")]
pub fn parse_ts(value: &models::Timestamp) -> Option<DateTime<Utc>> {
    Some(*value)
}

pub async fn connect(url: &str) -> Result<Db, sqlx::Error> {
    #[cfg(not(feature = "postgres"))]
    {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(pool)
    }
    #[cfg(feature = "postgres")]
    {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        Ok(pool)
    }
}

pub async fn migrate(pool: &Db) -> Result<(), sqlx::migrate::MigrateError> {
    #[cfg(not(feature = "postgres"))]
    {
        sqlx::migrate!("./migrations/sqlite").run(pool).await?;
    }
    #[cfg(feature = "postgres")]
    {
        sqlx::migrate!("./migrations/postgres").run(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_for_in_clause() {
        assert_eq!(placeholders(3), "?, ?, ?");
        assert_eq!(placeholders(0), "?");
    }

    #[cfg(not(feature = "postgres"))]
    #[test]
    fn timestamps_round_trip_and_sort() {
        let earlier = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = earlier + chrono::Duration::milliseconds(1);
        assert_eq!(ts(earlier), "2026-01-02T03:04:05.678Z");
        assert_eq!(parse_ts(&ts(earlier)), Some(earlier));
        assert!(ts(earlier) < ts(later));
    }
}
