use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;

use crate::AppState;
use crate::ai::{AiClient, ChatMessage, MAX_VARIATIONS};
use crate::auth::AuthenticatedUser;
use crate::error::AppError;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ai/variations", post(variations))
        .route("/support/chat", post(support_chat))
}

fn client(state: &AppState) -> Result<Arc<AiClient>, AppError> {
    state
        .ai
        .clone()
        .ok_or_else(|| AppError::Config("AI provider is not configured".into()))
}

#[derive(Deserialize)]
struct VariationsBody {
    message: String,
    count: usize,
}

async fn variations(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<VariationsBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::PreconditionFailed("message is required".into()));
    }
    if !(1..=MAX_VARIATIONS).contains(&body.count) {
        return Err(AppError::PreconditionFailed(format!(
            "count must be between 1 and {MAX_VARIATIONS}"
        )));
    }
    let client = client(&state)?;
    let variations = client.variations(body.message.trim(), body.count).await?;
    tracing::debug!(user_id = %auth.user_id, count = variations.len(), "variations generated");
    Ok(Json(serde_json::json!({ "variations": variations })))
}

#[derive(Deserialize)]
struct ChatBody {
    messages: Vec<ChatMessage>,
}

/// 本文の差分を `{"content": ..}` として流し、最後に `[DONE]` を送る
fn chat_events<S>(deltas: S) -> impl Stream<Item = Result<Event, Infallible>>
where
    S: Stream<Item = String>,
{
    deltas
        .map(|content| Event::default().data(serde_json::json!({ "content": content }).to_string()))
        .chain(futures_util::stream::once(async { Event::default().data("[DONE]") }))
        .map(Ok)
}

async fn support_chat(
    State(state): State<AppState>,
    _auth: AuthenticatedUser,
    Json(body): Json<ChatBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if body.messages.is_empty() {
        return Err(AppError::PreconditionFailed("messages are required".into()));
    }
    let client = client(&state)?;
    let deltas = client.stream_chat(body.messages).await?;
    Ok(Sse::new(chat_events(deltas)).keep_alive(KeepAlive::default()))
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use serde_json::json;

    use super::*;
    use crate::testing::{TestState, authed, send};

    #[tokio::test]
    async fn chat_is_reemitted_with_done() {
        let deltas = futures_util::stream::iter(vec!["Olá".to_string(), "!".to_string()]);
        let resp = Sse::new(chat_events(deltas)).into_response();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(
            text,
            "data: {\"content\":\"Olá\"}\n\ndata: {\"content\":\"!\"}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn count_is_bounded() {
        let t = TestState::new().await;
        let (status, _) = send(
            t.router(),
            authed("POST", "/v1/ai/variations", Some(json!({ "message": "Oi {nome}", "count": 11 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            t.router(),
            authed("POST", "/v1/ai/variations", Some(json!({ "message": "Oi {nome}", "count": 3 }))),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["kind"], "config_error");
    }

    #[tokio::test]
    async fn shared_client_from_state_is_used() {
        let mut t = TestState::new().await;
        let mut config = t.state.config.clone();
        config.ai_api_url = "http://127.0.0.1:9/v1/chat/completions".into();
        config.ai_api_key = Some("sk-test".into());
        let client = Arc::new(AiClient::from_config(&config).unwrap());
        t.state.ai = Some(client.clone());

        let (status, body) = send(
            t.router(),
            authed("POST", "/v1/support/chat", Some(json!({ "messages": [{ "role": "user", "content": "Oi" }] }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_ne!(body["kind"], "config_error");
        // ハンドラは状態の Arc を複製するだけで、新しいクライアントは作らない
        assert_eq!(Arc::strong_count(&client), 2);
    }
}
