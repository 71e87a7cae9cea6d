//! ワークフローエンジンと定期実行からの呼び出し。共有シークレットで保護する。

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::AppState;
use crate::campaign::sweeper::{self, CampaignStatusReply, MessageStatusCallback, SweepReport};
use crate::error::AppError;
use crate::types::CampaignId;

pub const SECRET_HEADER: &str = "x-callback-secret";

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/callbacks/message-status", post(message_status))
        .route("/callbacks/campaigns/{id}/status", get(campaign_status))
        .route("/sweeper/run", post(run_sweeper))
}

/// `x-callback-secret` が設定値と一致したリクエスト
pub struct CallbackCaller;

impl FromRequestParts<AppState> for CallbackCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let expected = state
            .config
            .callback_secret
            .as_deref()
            .ok_or_else(|| AppError::Config("callback secret is not configured".into()))?;
        let provided = parts
            .headers
            .get(SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing callback secret".into()))?;
        if provided != expected {
            return Err(AppError::Unauthorized("invalid callback secret".into()));
        }
        Ok(CallbackCaller)
    }
}

async fn message_status(
    State(state): State<AppState>,
    _caller: CallbackCaller,
    Json(body): Json<MessageStatusCallback>,
) -> Result<Json<serde_json::Value>, AppError> {
    let updated = sweeper::record_message_status(&state, &body).await?;
    Ok(Json(serde_json::json!({ "success": true, "updated": updated })))
}

async fn campaign_status(
    State(state): State<AppState>,
    _caller: CallbackCaller,
    Path(id): Path<String>,
) -> Result<Json<CampaignStatusReply>, AppError> {
    Ok(Json(sweeper::campaign_status(&state, &CampaignId(id)).await?))
}

async fn run_sweeper(
    State(state): State<AppState>,
    _caller: CallbackCaller,
) -> Result<Json<SweepReport>, AppError> {
    let report = sweeper::sweep(&state, chrono::Utc::now()).await?;
    tracing::info!(?report, "sweeper run");
    Ok(Json(report))
}
