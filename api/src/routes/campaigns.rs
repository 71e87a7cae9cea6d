use std::convert::Infallible;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Deserialize;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::campaign::orchestrator::{self, CampaignRequest};
use crate::db;
use crate::db::models::{CampaignRow, MessageLogRow};
use crate::error::AppError;
use crate::events::{CampaignEvent, CampaignSubscription};
use crate::types::{CampaignId, CampaignStatus};

/// base64 の画像（最大 10MB）を含めた本文の上限
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/campaigns",
            get(list_campaigns)
                .post(create_campaign)
                .layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route(
            "/campaigns/schedule",
            post(schedule_campaign).layer(DefaultBodyLimit::max(MAX_BODY_BYTES)),
        )
        .route("/campaigns/{id}", get(get_campaign))
        .route("/campaigns/{id}/logs", get(get_logs))
        .route("/campaigns/{id}/events", get(campaign_events))
        .route("/campaigns/{id}/pause", post(pause_campaign))
        .route("/campaigns/{id}/resume", post(resume_campaign))
        .route("/campaigns/{id}/cancel", post(cancel_campaign))
}

async fn load_campaign(
    state: &AppState,
    auth: &AuthenticatedUser,
    id: &CampaignId,
) -> Result<CampaignRow, AppError> {
    db::campaigns::get_campaign_for_user(&state.pool, &auth.user_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {id}")))
}

/// 即時送信。送信はバックグラウンドで続き、進捗は `/events` で受け取る。
async fn create_campaign(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<CampaignRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (campaign_id, _handle) = orchestrator::start(&state, &auth, &body).await?;
    let campaign = load_campaign(&state, &auth, &campaign_id).await?;
    Ok(Json(serde_json::json!({
        "campaign_id": campaign_id,
        "status": campaign.status,
        "total_contacts": campaign.total_contacts,
    })))
}

#[derive(Deserialize)]
struct ScheduleBody {
    #[serde(flatten)]
    request: CampaignRequest,
    scheduled_at: DateTime<Utc>,
}

async fn schedule_campaign(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let prepared =
        orchestrator::prepare(&state, &auth, &body.request, Some(body.scheduled_at)).await?;
    let campaign = load_campaign(&state, &auth, &prepared.id).await?;
    Ok(Json(serde_json::json!({
        "campaign_id": prepared.id,
        "status": campaign.status,
        "scheduled_at": campaign.scheduled_at,
        "total_contacts": campaign.total_contacts,
    })))
}

async fn list_campaigns(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<Vec<CampaignRow>>, AppError> {
    let campaigns = db::campaigns::get_campaigns(&state.pool, &auth.user_id).await?;
    Ok(Json(campaigns))
}

async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = CampaignId(id);
    let campaign = load_campaign(&state, &auth, &id).await?;
    let counts = db::message_logs::count_by_status(&state.pool, &id).await?;
    Ok(Json(serde_json::json!({
        "campaign": campaign,
        "counts": counts,
    })))
}

async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<Vec<MessageLogRow>>, AppError> {
    let id = CampaignId(id);
    load_campaign(&state, &auth, &id).await?;
    Ok(Json(db::message_logs::get_logs(&state.pool, &id).await?))
}

struct EventStream {
    subscription: CampaignSubscription,
    first: Option<CampaignEvent>,
    finished: bool,
}

fn to_sse(event: &CampaignEvent) -> Event {
    let name = match event {
        CampaignEvent::CampaignUpdated { .. } => "campaign",
        CampaignEvent::MessageUpdated { .. } => "message",
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(event).unwrap_or_default())
}

/// 現在の状態を最初に送り、以降は更新を流す。終端状態に達したら閉じる。
fn event_stream(
    subscription: CampaignSubscription,
    first: CampaignEvent,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let stream = EventStream {
        subscription,
        first: Some(first),
        finished: false,
    };
    futures_util::stream::unfold(stream, |mut stream| async move {
        if stream.finished {
            return None;
        }
        let event = match stream.first.take() {
            Some(event) => event,
            None => stream.subscription.next().await?,
        };
        if let CampaignEvent::CampaignUpdated { status, .. } = &event
            && status.is_terminal()
        {
            stream.finished = true;
        }
        Some((Ok(to_sse(&event)), stream))
    })
}

async fn campaign_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let id = CampaignId(id);
    // 取りこぼさないよう、現在値を読む前に購読する
    let subscription = state.events.subscribe(id.clone());
    let campaign = load_campaign(&state, &auth, &id).await?;
    let first = CampaignEvent::CampaignUpdated {
        campaign_id: id,
        status: campaign.status(),
        sent_count: campaign.sent_count,
        failed_count: campaign.failed_count,
    };
    Ok(Sse::new(event_stream(subscription, first)).keep_alive(KeepAlive::default()))
}

async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<CampaignRow>, AppError> {
    let campaign =
        orchestrator::change_status(&state, &auth, &CampaignId(id), CampaignStatus::Paused).await?;
    Ok(Json(campaign))
}

async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = CampaignId(id);
    let _handle = orchestrator::resume(&state, &auth, &id).await?;
    Ok(Json(serde_json::json!({
        "campaign_id": id,
        "status": CampaignStatus::InProgress,
    })))
}

async fn cancel_campaign(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<CampaignRow>, AppError> {
    let campaign =
        orchestrator::change_status(&state, &auth, &CampaignId(id), CampaignStatus::Cancelled)
            .await?;
    Ok(Json(campaign))
}
