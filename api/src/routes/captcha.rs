use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::AppState;
use crate::captcha::CaptchaVerifier;
use crate::error::AppError;

/// ログイン前に呼ばれるため認証は不要
pub fn public_routes() -> Router<AppState> {
    Router::new().route("/auth/verify-captcha", post(verify_captcha))
}

#[derive(Deserialize)]
struct CaptchaBody {
    token: String,
}

async fn verify_captcha(
    State(state): State<AppState>,
    Json(body): Json<CaptchaBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.token.trim().is_empty() {
        return Err(AppError::PreconditionFailed("captcha token is required".into()));
    }
    let verifier = CaptchaVerifier::from_config(&state.config)
        .ok_or_else(|| AppError::Config("captcha secret is not configured".into()))?;
    let result = verifier.verify(body.token.trim()).await?;
    if !result.passed() {
        tracing::info!(score = ?result.score, errors = ?result.error_codes, "captcha rejected");
        return Err(AppError::Forbidden("captcha verification failed".into()));
    }
    Ok(Json(serde_json::json!({ "success": true, "score": result.score })))
}
