use crate::error::ZapflowError;

/// 国番号 (ブラジル)
const BR_COUNTRY_CODE: &str = "55";

/// 数字以外をすべて取り除く。
pub fn digits(s: &str) -> String {
    s.chars().filter(char::is_ascii_digit).collect()
}

/// WhatsApp JID から電話番号部分を取り出す。
///
/// `5565999852826@s.whatsapp.net` や `5565999852826:12@c.us` のような
/// サフィックス付きの値を `5565999852826` にする。
pub fn strip_jid(s: &str) -> &str {
    let without_server = s.split('@').next().unwrap_or(s);
    without_server.split(':').next().unwrap_or(without_server)
}

/// 送信先として使える番号か検証し、数字のみの形式で返す。
///
/// E.164 に準ずる: 先頭の `+` は任意、最初の桁は 1-9、合計 8〜15 桁。
/// 空白・ハイフン・括弧・ドットは区切りとして許容する。
pub fn validate(s: &str) -> Result<String, ZapflowError> {
    let trimmed = strip_jid(s.trim());
    let body = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if body.is_empty() {
        return Err(ZapflowError::InvalidPhone("phone number is empty".into()));
    }
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '(' | ')' | '.'))
    {
        return Err(ZapflowError::InvalidPhone(format!(
            "{s}: contains invalid characters"
        )));
    }
    let d = digits(body);
    if !(8..=15).contains(&d.len()) {
        return Err(ZapflowError::InvalidPhone(format!(
            "{s}: must have between 8 and 15 digits"
        )));
    }
    if d.starts_with('0') {
        return Err(ZapflowError::InvalidPhone(format!(
            "{s}: must not start with 0"
        )));
    }
    Ok(d)
}

/// 重複判定用の正規化キーを返す。
///
/// ブラジルの携帯番号は 9 桁目の `9` の有無で同一番号が二通りに書かれるため、
/// `55` + DDD + `9` + 8 桁 の 13 桁形式からは `9` を落として 12 桁に揃える。
/// 国番号なしの 10/11 桁は `55` を補う。何度適用しても結果は変わらない。
pub fn normalize_for_comparison(s: &str) -> String {
    let mut d = digits(strip_jid(s));
    if d.len() == 10 || d.len() == 11 {
        d.insert_str(0, BR_COUNTRY_CODE);
    }
    if d.len() == 13 && d.starts_with(BR_COUNTRY_CODE) && d.as_bytes()[4] == b'9' {
        d.remove(4);
    }
    d
}

/// 保存されている可能性のある表記をすべて返す（問い合わせ用）。
///
/// 入力そのものの数字列、正規化キー、`9` を補った 13 桁形式。重複は除く。
pub fn comparison_variants(s: &str) -> Vec<String> {
    let raw = digits(strip_jid(s));
    let key = normalize_for_comparison(s);
    let mut variants = vec![raw];
    if !variants.contains(&key) {
        variants.push(key.clone());
    }
    if key.len() == 12 && key.starts_with(BR_COUNTRY_CODE) {
        let with_nine = format!("{}9{}", &key[..4], &key[4..]);
        if !variants.contains(&with_nine) {
            variants.push(with_nine);
        }
    }
    variants.retain(|v| !v.is_empty());
    variants
}
