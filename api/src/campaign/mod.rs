//! キャンペーンの受信者解決・即時送信・予約送信。

pub mod orchestrator;
pub mod recipients;
pub mod runs;
pub mod sweeper;
