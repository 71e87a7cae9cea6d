//! 即時送信キャンペーンの準備と送信ループ。
//!
//! 1. 前提条件の検証（ここで失敗した場合は何も書き込まない）
//! 2. キャンペーン・全受信者分のログ・新規連絡先を1トランザクションで作成
//! 3. バックグラウンドで1件ずつ順番に配信
//!
//! 送信ループは毎回キャンペーンの状態を読み直し、`paused`/`cancelled` になっていれば
//! 残りのログを `pending` のまま止まる。再開時は残りの `pending` だけを送る。
//! 1つのキャンペーンで同時に送るループは常に1つ（[`super::runs`]）。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use zapflow_common::{phone, template};

use super::recipients::{self, RecipientSource};
use super::runs::{RunLease, RunTicket};
use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::db::campaigns::{NewCampaign, NewMessageLog};
use crate::db::contacts::NewContact;
use crate::db::models::{CampaignRow, MessageLogRow};
use crate::error::AppError;
use crate::events::CampaignEvent;
use crate::gateway::delivery::{DeliveryGateway, OutgoingMessage};
use crate::storage::Media;
use crate::types::{
    CampaignId, CampaignStatus, ContactStatus, InstanceId, MessageLogId, MessageStatus, UserId,
};

/// 画像サイズ上限: 10MB
const MAX_IMAGE_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_IMAGE_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignImage {
    /// 生の base64 か `data:<mime>;base64,...` 形式
    pub base64: String,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl CampaignImage {
    pub fn decode(&self) -> Result<Media, AppError> {
        let (data_url_type, payload) = match self.base64.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest.split_once(',').ok_or_else(|| {
                    AppError::PreconditionFailed("malformed image data URL".into())
                })?;
                let mime = header.strip_suffix(";base64").unwrap_or(header);
                (Some(mime.to_string()).filter(|m| !m.is_empty()), payload)
            }
            None => (None, self.base64.as_str()),
        };
        let data = STANDARD
            .decode(payload.trim())
            .map_err(|e| AppError::PreconditionFailed(format!("invalid image base64: {e}")))?;
        if data.is_empty() {
            return Err(AppError::PreconditionFailed("image is empty".into()));
        }
        if data.len() > MAX_IMAGE_SIZE {
            return Err(AppError::PreconditionFailed("image too large".into()));
        }
        let content_type = self
            .mimetype
            .clone()
            .or(data_url_type)
            .unwrap_or_else(|| DEFAULT_IMAGE_TYPE.into());
        Ok(Media { data, content_type })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignRequest {
    pub campaign_name: String,
    #[serde(default)]
    pub message: Option<String>,
    /// 事前に生成したバリエーション。空なら `message` を使う。
    #[serde(default)]
    pub variations: Vec<String>,
    #[serde(default)]
    pub image: Option<CampaignImage>,
    pub source: RecipientSource,
}

impl CampaignRequest {
    /// 本文のバリエーション。画像のみのキャンペーンは空文字1件になる。
    fn message_variations(&self) -> Result<Vec<String>, AppError> {
        let variations: Vec<String> = self
            .variations
            .iter()
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();
        if !variations.is_empty() {
            return Ok(variations);
        }
        match self.message.as_deref().map(str::trim) {
            Some(message) if !message.is_empty() => Ok(vec![message.to_string()]),
            _ if self.image.is_some() => Ok(vec![String::new()]),
            _ => Err(AppError::PreconditionFailed(
                "a message or an image is required".into(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreparedCampaign {
    pub id: CampaignId,
    pub media: Option<Media>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// 利用者の操作で止まった（その時点の状態）
    Stopped(CampaignStatus),
    /// 再開で起動された新しいループに引き継いだ
    Superseded,
    Failed,
}

/// 検証して全ログを作成する。`schedule` が指定されれば予約キャンペーンとして作る。
pub async fn prepare(
    state: &AppState,
    user: &AuthenticatedUser,
    request: &CampaignRequest,
    schedule: Option<DateTime<Utc>>,
) -> Result<PreparedCampaign, AppError> {
    let campaign_name = request.campaign_name.trim();
    if campaign_name.is_empty() {
        return Err(AppError::PreconditionFailed(
            "campaign name is required".into(),
        ));
    }
    let variations = request.message_variations()?;
    let media = request.image.as_ref().map(CampaignImage::decode).transpose()?;

    let instance = db::instances::get_instance_for_user(&state.pool, &user.user_id).await?;
    let instance = match (instance, schedule) {
        (Some(instance), Some(_)) => instance,
        (Some(instance), None) if instance.is_connected() => instance,
        _ => return Err(AppError::PreconditionFailed("WhatsApp not connected".into())),
    };

    match schedule {
        None if state.delivery.is_none() => {
            return Err(AppError::Config("delivery gateway is not configured".into()));
        }
        Some(at) if at <= Utc::now() => {
            return Err(AppError::PreconditionFailed(
                "scheduled_at must be in the future".into(),
            ));
        }
        _ => {}
    }

    let recipients = recipients::resolve(
        &state.pool,
        state.instances.as_deref(),
        &user.user_id,
        Some(&instance.instance_name),
        &request.source,
    )
    .await?;
    if recipients.is_empty() {
        return Err(AppError::PreconditionFailed("no recipients".into()));
    }
    if recipients.len() > state.config.max_recipients {
        return Err(AppError::PreconditionFailed(format!(
            "too many recipients: {} (max {})",
            recipients.len(),
            state.config.max_recipients
        )));
    }
    let mut validated = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let phone = phone::validate(&recipient.phone)?;
        validated.push((recipient, phone));
    }

    state
        .access
        .require_access(&state.pool, state.billing.as_deref(), user)
        .await?;

    let mut logs = Vec::with_capacity(validated.len());
    let mut new_contacts: Vec<NewContact> = Vec::new();
    for (i, (recipient, phone_number)) in validated.into_iter().enumerate() {
        let known = db::contacts::find_by_phone(&state.pool, &user.user_id, &phone_number).await?;
        let blocked = known.iter().any(|c| c.is_unsubscribed());
        let name = recipient
            .name
            .clone()
            .or_else(|| known.iter().find_map(|c| c.name.clone()));
        if known.is_empty() && !recipient.tag_sourced {
            new_contacts.push(NewContact {
                phone_number: phone_number.clone(),
                name: name.clone(),
                tags: Vec::new(),
                status: ContactStatus::Active,
                birthday: None,
            });
        }

        let (variation_index, variation) = template::select_variation(&variations, i)?;
        logs.push(NewMessageLog {
            position: i as i64,
            client_name: name.clone().unwrap_or_default(),
            client_phone: phone_number,
            message: template::render(variation, name.as_deref()),
            message_variation_index: variation_index as i64,
            status: if blocked {
                MessageStatus::Blocked
            } else {
                MessageStatus::Pending
            },
        });
    }

    let status = if schedule.is_some() {
        CampaignStatus::Scheduled
    } else {
        CampaignStatus::InProgress
    };
    let campaign = NewCampaign {
        user_id: user.user_id.clone(),
        instance_id: InstanceId(instance.id.clone()),
        campaign_name: campaign_name.to_string(),
        message_variations: variations,
        target_tags: request.source.target_tags(),
        status,
        scheduled_at: schedule,
    };
    let id =
        db::campaigns::create_campaign_with_logs(&state.pool, &campaign, &logs, &new_contacts)
            .await?;
    tracing::info!(
        campaign_id = %id,
        user_id = %user.user_id,
        recipients = logs.len(),
        blocked = logs.iter().filter(|l| l.status == MessageStatus::Blocked).count(),
        %status,
        "campaign prepared"
    );

    if let Some(media) = &media
        && let Err(e) = state.media.put_campaign_media(&id, media.clone()).await
    {
        tracing::warn!(campaign_id = %id, error = %e, "failed to store campaign media");
        db::campaigns::transition(&state.pool, &id, CampaignStatus::Failed).await?;
        return Err(AppError::DeliveryFailed(
            "failed to store campaign media".into(),
        ));
    }

    publish_campaign(state, &id).await;
    Ok(PreparedCampaign { id, media })
}

/// 即時送信: 準備して送信ループをバックグラウンドで開始する。
pub async fn start(
    state: &AppState,
    user: &AuthenticatedUser,
    request: &CampaignRequest,
) -> Result<(CampaignId, JoinHandle<RunOutcome>), AppError> {
    let prepared = prepare(state, user, request, None).await?;
    let handle = spawn_run(state.clone(), prepared.id.clone(), prepared.media);
    Ok((prepared.id, handle))
}

pub fn spawn_run(
    state: AppState,
    campaign_id: CampaignId,
    media: Option<Media>,
) -> JoinHandle<RunOutcome> {
    // 世代は起動前に進め、実行中の古いループを次の確認で止める
    let ticket = state.runs.issue(&campaign_id);
    tokio::spawn(async move { run_ticket(&state, &campaign_id, ticket, media).await })
}

/// 送信ループ。ストレージのエラーで中断した場合はキャンペーンを `failed` にする。
pub async fn run(state: &AppState, campaign_id: &CampaignId, media: Option<Media>) -> RunOutcome {
    let ticket = state.runs.issue(campaign_id);
    run_ticket(state, campaign_id, ticket, media).await
}

async fn run_ticket(
    state: &AppState,
    campaign_id: &CampaignId,
    ticket: RunTicket,
    media: Option<Media>,
) -> RunOutcome {
    let lease = ticket.acquire().await;
    match dispatch(state, campaign_id, media, &lease).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%campaign_id, error = %e, "campaign run aborted");
            if let Err(e) =
                db::campaigns::transition(&state.pool, campaign_id, CampaignStatus::Failed).await
            {
                tracing::error!(%campaign_id, error = %e, "failed to mark campaign as failed");
            }
            publish_campaign(state, campaign_id).await;
            RunOutcome::Failed
        }
    }
}

async fn dispatch(
    state: &AppState,
    campaign_id: &CampaignId,
    media: Option<Media>,
    lease: &RunLease,
) -> Result<RunOutcome, AppError> {
    let campaign = db::campaigns::get_campaign(&state.pool, campaign_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))?;
    let instance_id = InstanceId(campaign.instance_id.clone());
    let instance = db::instances::get_instance(&state.pool, &instance_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("instance {instance_id}")))?;
    let delivery = state
        .delivery
        .clone()
        .ok_or_else(|| AppError::Config("delivery gateway is not configured".into()))?;
    let image = media.map(|m| STANDARD.encode(m.data));
    let user_id = UserId(campaign.user_id.clone());

    let pending = db::message_logs::get_pending(&state.pool, campaign_id).await?;
    tracing::info!(
        %campaign_id,
        pending = pending.len(),
        generation = lease.generation(),
        "campaign dispatch started"
    );

    let mut called = false;
    for log in pending {
        if let Some(outcome) = stop_requested(state, campaign_id, lease).await? {
            return Ok(outcome);
        }

        // 準備後に配信停止した受信者
        let contacts = db::contacts::find_by_phone(&state.pool, &user_id, &log.client_phone).await?;
        if contacts.iter().any(|c| c.is_unsubscribed()) {
            let log_id = MessageLogId(log.id.clone());
            if db::message_logs::mark_blocked(&state.pool, &log_id).await? {
                publish_message(state, campaign_id, &log, MessageStatus::Blocked, None);
            }
            continue;
        }

        if called {
            tokio::time::sleep(state.config.send_delay).await;
            if let Some(outcome) = stop_requested(state, campaign_id, lease).await? {
                return Ok(outcome);
            }
        }

        // 読み出し後にコールバック等で確定したログは送らない
        let log_id = MessageLogId(log.id.clone());
        let still_pending = db::message_logs::get_log(&state.pool, &log_id)
            .await?
            .is_some_and(|l| l.status() == MessageStatus::Pending);
        if !still_pending {
            continue;
        }
        called = true;

        let message = OutgoingMessage {
            instance_name: instance.instance_name.clone(),
            api_key: instance.api_key.clone(),
            number: log.client_phone.clone(),
            text: (!log.message.is_empty()).then(|| log.message.clone()),
            image: image.clone(),
        };
        deliver_one(state, delivery.as_ref(), campaign_id, &log, &message).await?;
        publish_campaign(state, campaign_id).await;
    }

    if !lease.is_current() {
        return Ok(RunOutcome::Superseded);
    }
    if db::campaigns::transition(&state.pool, campaign_id, CampaignStatus::Completed).await? {
        publish_campaign(state, campaign_id).await;
        return Ok(RunOutcome::Completed);
    }
    let current = current_status(state, campaign_id).await?;
    Ok(RunOutcome::Stopped(current))
}

async fn deliver_one(
    state: &AppState,
    delivery: &dyn DeliveryGateway,
    campaign_id: &CampaignId,
    log: &MessageLogRow,
    message: &OutgoingMessage,
) -> Result<(), AppError> {
    let log_id = MessageLogId(log.id.clone());
    match delivery.deliver(message).await {
        Ok(()) => {
            if db::message_logs::mark_sent(&state.pool, &log_id).await? {
                db::campaigns::increment_sent(&state.pool, campaign_id).await?;
                publish_message(state, campaign_id, log, MessageStatus::Sent, None);
            }
        }
        Err(error) => {
            tracing::warn!(%campaign_id, log_id = %log_id, %error, "message delivery failed");
            if db::message_logs::mark_failed(&state.pool, &log_id, &error).await? {
                db::campaigns::increment_failed(&state.pool, campaign_id).await?;
                publish_message(state, campaign_id, log, MessageStatus::Failed, Some(error));
            }
        }
    }
    Ok(())
}

async fn current_status(
    state: &AppState,
    campaign_id: &CampaignId,
) -> Result<CampaignStatus, AppError> {
    let campaign = db::campaigns::get_campaign(&state.pool, campaign_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))?;
    Ok(campaign.status())
}

/// 送信を続けてよければ `None`
async fn stop_requested(
    state: &AppState,
    campaign_id: &CampaignId,
    lease: &RunLease,
) -> Result<Option<RunOutcome>, AppError> {
    if !lease.is_current() {
        tracing::info!(%campaign_id, generation = lease.generation(), "campaign dispatch superseded");
        return Ok(Some(RunOutcome::Superseded));
    }
    let status = current_status(state, campaign_id).await?;
    if status == CampaignStatus::InProgress {
        return Ok(None);
    }
    tracing::info!(%campaign_id, %status, "campaign dispatch stopped");
    Ok(Some(RunOutcome::Stopped(status)))
}

/// `paused` のキャンペーンを再開し、残りの `pending` を送る。
/// 停止前のループがまだ送信中なら、そのループが抜けてから送り始める。
pub async fn resume(
    state: &AppState,
    user: &AuthenticatedUser,
    campaign_id: &CampaignId,
) -> Result<JoinHandle<RunOutcome>, AppError> {
    let campaign = find_for_user(state, user, campaign_id).await?;
    if campaign.status() != CampaignStatus::Paused {
        return Err(AppError::Conflict(format!(
            "campaign is {}, only paused campaigns can be resumed",
            campaign.status()
        )));
    }
    let instance = db::instances::get_instance_for_user(&state.pool, &user.user_id).await?;
    if !instance.is_some_and(|i| i.is_connected()) {
        return Err(AppError::PreconditionFailed("WhatsApp not connected".into()));
    }
    if state.delivery.is_none() {
        return Err(AppError::Config("delivery gateway is not configured".into()));
    }
    state
        .access
        .require_access(&state.pool, state.billing.as_deref(), user)
        .await?;
    let media = state
        .media
        .get_campaign_media(campaign_id)
        .await
        .map_err(|e| AppError::BadGateway(format!("failed to load campaign media: {e}")))?;

    if !db::campaigns::transition(&state.pool, campaign_id, CampaignStatus::InProgress).await? {
        return Err(AppError::Conflict("campaign status changed".into()));
    }
    publish_campaign(state, campaign_id).await;
    Ok(spawn_run(state.clone(), campaign_id.clone(), media))
}

/// 一時停止・キャンセル。送信ループは次の受信者の前に止まる。
pub async fn change_status(
    state: &AppState,
    user: &AuthenticatedUser,
    campaign_id: &CampaignId,
    to: CampaignStatus,
) -> Result<CampaignRow, AppError> {
    let campaign = find_for_user(state, user, campaign_id).await?;
    if !campaign.status().can_transition_to(to)
        || !db::campaigns::transition(&state.pool, campaign_id, to).await?
    {
        return Err(AppError::Conflict(format!(
            "campaign cannot change from {} to {to}",
            campaign.status()
        )));
    }
    publish_campaign(state, campaign_id).await;
    find_for_user(state, user, campaign_id).await
}

async fn find_for_user(
    state: &AppState,
    user: &AuthenticatedUser,
    campaign_id: &CampaignId,
) -> Result<CampaignRow, AppError> {
    db::campaigns::get_campaign_for_user(&state.pool, &user.user_id, campaign_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))
}

pub(crate) async fn publish_campaign(state: &AppState, campaign_id: &CampaignId) {
    match db::campaigns::get_campaign(&state.pool, campaign_id).await {
        Ok(Some(campaign)) => state.events.publish(CampaignEvent::CampaignUpdated {
            campaign_id: campaign_id.clone(),
            status: campaign.status(),
            sent_count: campaign.sent_count,
            failed_count: campaign.failed_count,
        }),
        Ok(None) => {}
        Err(e) => tracing::warn!(%campaign_id, error = %e, "failed to load campaign for event"),
    }
}

pub(crate) fn publish_message(
    state: &AppState,
    campaign_id: &CampaignId,
    log: &MessageLogRow,
    status: MessageStatus,
    error: Option<String>,
) {
    state.events.publish(CampaignEvent::MessageUpdated {
        campaign_id: campaign_id.clone(),
        log_id: log.id.clone(),
        status,
        error,
    });
}
