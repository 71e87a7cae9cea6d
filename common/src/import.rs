//! 表形式（スプレッドシート由来）の行から連絡先を取り込む。
//!
//! バイナリ形式 (`.xlsx` 等) の解析はクライアント側で行い、サーバには
//! ヘッダ名をキーとするオブジェクトの配列が届く。

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ZapflowError;
use crate::optout::normalize_text;
use crate::phone;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedContact {
    pub name: Option<String>,
    pub phone: String,
    pub tags: Vec<String>,
    pub birthday: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRow {
    /// 1始まりのデータ行番号（ヘッダ行を除く）
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub contacts: Vec<ImportedContact>,
    pub rejected: Vec<RejectedRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    Name,
    Phone,
    Tags,
    Birthday,
}

fn classify_header(header: &str) -> Option<Column> {
    match normalize_text(header.trim()).as_str() {
        "nome do cliente" | "nome" | "name" | "cliente" => Some(Column::Name),
        "telefone do cliente" | "telefone" | "phone" | "celular" | "whatsapp" | "numero" => {
            Some(Column::Phone)
        }
        "tags" | "etiquetas" => Some(Column::Tags),
        "aniversario" | "data de nascimento" | "birthday" => Some(Column::Birthday),
        _ => None,
    }
}

fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        // 電話番号が数値セルとして届くことがある
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(u), _) => u.to_string(),
            (None, Some(f)) if f.fract() == 0.0 => format!("{f:.0}"),
            _ => n.to_string(),
        },
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn column_value(row: &Row, column: Column) -> Option<String> {
    row.iter()
        .find(|(header, _)| classify_header(header) == Some(column))
        .and_then(|(_, value)| cell_text(value))
}

/// カンマまたはセミコロン区切りのタグ列を分割する（順序維持・重複除去）。
pub fn split_tags(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.split([',', ';'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_string()))
        .map(str::to_string)
        .collect()
}

/// `dd/mm/yyyy` または `yyyy-mm-dd`
pub fn parse_birthday(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d"))
        .ok()
}

pub fn parse_rows(rows: &[Row]) -> Result<ImportReport, ZapflowError> {
    let has_phone_column = rows
        .iter()
        .flat_map(|row| row.keys())
        .any(|header| classify_header(header) == Some(Column::Phone));
    if !rows.is_empty() && !has_phone_column {
        return Err(ZapflowError::InvalidImport(
            "no phone column found (expected e.g. \"Telefone do Cliente\")".into(),
        ));
    }

    let mut report = ImportReport::default();
    let mut seen = HashSet::new();
    for (i, row) in rows.iter().enumerate() {
        let row_number = i + 1;
        let Some(raw_phone) = column_value(row, Column::Phone) else {
            report.rejected.push(RejectedRow {
                row: row_number,
                reason: "missing phone number".into(),
            });
            continue;
        };
        let phone = match phone::validate(&raw_phone) {
            Ok(p) => p,
            Err(e) => {
                report.rejected.push(RejectedRow {
                    row: row_number,
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !seen.insert(phone::normalize_for_comparison(&phone)) {
            report.rejected.push(RejectedRow {
                row: row_number,
                reason: "duplicate phone number in file".into(),
            });
            continue;
        }
        report.contacts.push(ImportedContact {
            name: column_value(row, Column::Name),
            phone,
            tags: column_value(row, Column::Tags)
                .map(|t| split_tags(&t))
                .unwrap_or_default(),
            birthday: column_value(row, Column::Birthday).and_then(|b| parse_birthday(&b)),
        });
    }
    Ok(report)
}
