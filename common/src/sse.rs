//! Chat-completion のストリーミング応答 (Server-Sent Events) の行パーサ。

/// 1行分の解釈結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// 追加されたテキスト断片
    Delta(String),
    /// `data: [DONE]` による終端
    Done,
    /// コメント・空行・content を含まないチャンク
    Ignored,
}

pub fn parse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignored;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(chunk) = serde_json::from_str::<serde_json::Value>(data) else {
        return SseLine::Ignored;
    };
    match chunk["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Ignored,
    }
}
