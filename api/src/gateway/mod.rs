//! 外部サービスとの境界。いずれもトレイトで抽象化し、テストでは差し替える。

pub mod delivery;
pub mod instance;
pub mod workflow;

/// 非 2xx 応答を送信失敗として記録する文言
pub(crate) fn http_status_error(status: reqwest::StatusCode) -> String {
    format!("HTTP {}", status.as_u16())
}
