use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// 受信メッセージにこれらの語が含まれていれば配信停止とみなす（正規化後の部分一致）。
pub const OPT_OUT_KEYWORDS: &[&str] = &["nao", "sair", "parar", "cancelar", "stop", "remover"];

/// 小文字化し、NFD 分解した上で結合文字（アクセント記号）を取り除く。
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// 最初に一致したキーワードを返す。
pub fn matched_keyword(text: &str) -> Option<&'static str> {
    let normalized = normalize_text(text);
    OPT_OUT_KEYWORDS
        .iter()
        .copied()
        .find(|keyword| normalized.contains(keyword))
}

pub fn is_opt_out(text: &str) -> bool {
    matched_keyword(text).is_some()
}
