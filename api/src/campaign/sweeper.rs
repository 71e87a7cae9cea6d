//! 予約キャンペーンの起動と、ワークフローエンジンからのコールバック処理。
//!
//! 期限の来た `scheduled` キャンペーンを `in_progress` に確保してから、残りの `pending`
//! ログをまとめて1回の webhook でエンジンに渡す。エンジンは1通ごとに結果を返し、
//! バッチの合間に状態を問い合わせて中止を知る。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::orchestrator::{publish_campaign, publish_message};
use crate::AppState;
use crate::db;
use crate::db::models::{CampaignRow, MessageLogRow};
use crate::error::AppError;
use crate::gateway::workflow::{BatchContact, BatchMedia, CampaignBatch};
use crate::types::{CampaignId, CampaignStatus, InstanceId, MessageLogId, MessageStatus, UserId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub due: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// 他のスイーパが先に確保した
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepResult {
    Dispatched,
    Completed,
    Failed,
    Skipped,
}

pub async fn sweep(state: &AppState, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
    let due = db::campaigns::get_due_scheduled(&state.pool, now).await?;
    let mut report = SweepReport {
        due: due.len(),
        ..SweepReport::default()
    };
    for campaign in due {
        let id = CampaignId(campaign.id.clone());
        let result = match sweep_one(state, &campaign).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(campaign_id = %id, error = %e, "scheduled campaign sweep failed");
                mark_failed(state, &id).await;
                SweepResult::Failed
            }
        };
        match result {
            SweepResult::Dispatched => report.dispatched += 1,
            SweepResult::Completed => report.completed += 1,
            SweepResult::Failed => report.failed += 1,
            SweepResult::Skipped => report.skipped += 1,
        }
    }
    if report.due > 0 {
        tracing::info!(?report, "sweep finished");
    }
    Ok(report)
}

async fn mark_failed(state: &AppState, id: &CampaignId) {
    match db::campaigns::transition(&state.pool, id, CampaignStatus::Failed).await {
        Ok(_) => publish_campaign(state, id).await,
        Err(e) => tracing::error!(campaign_id = %id, error = %e, "failed to mark campaign as failed"),
    }
}

async fn sweep_one(state: &AppState, campaign: &CampaignRow) -> Result<SweepResult, AppError> {
    let id = CampaignId(campaign.id.clone());
    let instance =
        db::instances::get_instance(&state.pool, &InstanceId(campaign.instance_id.clone())).await?;
    let Some(instance) = instance.filter(|i| i.is_connected()) else {
        tracing::warn!(campaign_id = %id, "instance not connected, scheduled campaign failed");
        mark_failed(state, &id).await;
        return Ok(SweepResult::Failed);
    };

    if !db::campaigns::transition(&state.pool, &id, CampaignStatus::InProgress).await? {
        return Ok(SweepResult::Skipped);
    }
    publish_campaign(state, &id).await;

    let pending = without_opted_out(state, campaign, &id).await?;
    if pending.is_empty() {
        db::campaigns::transition(&state.pool, &id, CampaignStatus::Completed).await?;
        publish_campaign(state, &id).await;
        return Ok(SweepResult::Completed);
    }

    let Some(workflow) = state.workflow.clone() else {
        tracing::error!(campaign_id = %id, "workflow engine is not configured");
        mark_failed(state, &id).await;
        return Ok(SweepResult::Failed);
    };

    let media = state
        .media
        .get_campaign_media(&id)
        .await
        .map_err(|e| AppError::BadGateway(format!("failed to load campaign media: {e}")))?;

    let batch = CampaignBatch {
        campaign_id: id.to_string(),
        instance_name: instance.instance_name,
        api_key: instance.api_key,
        message: campaign
            .message_variations
            .first()
            .cloned()
            .unwrap_or_default(),
        media: media.map(|m| BatchMedia {
            base64: STANDARD.encode(m.data),
            mimetype: m.content_type,
        }),
        contacts: pending
            .into_iter()
            .map(|log| BatchContact {
                log_id: log.id,
                name: log.client_name,
                phone: log.client_phone,
                message: log.message,
            })
            .collect(),
        callback_url: format!("{}/callbacks/message-status", state.config.public_url),
        status_url: format!("{}/callbacks/campaigns/{id}/status", state.config.public_url),
    };

    if let Err(e) = workflow.dispatch(&batch).await {
        tracing::warn!(campaign_id = %id, error = %e, "workflow dispatch failed");
        mark_failed(state, &id).await;
        return Ok(SweepResult::Failed);
    }
    tracing::info!(campaign_id = %id, contacts = batch.contacts.len(), "scheduled campaign dispatched");
    Ok(SweepResult::Dispatched)
}

/// 予約後に配信停止した受信者のログを `blocked` にし、残りの `pending` を返す
async fn without_opted_out(
    state: &AppState,
    campaign: &CampaignRow,
    id: &CampaignId,
) -> Result<Vec<MessageLogRow>, AppError> {
    let user_id = UserId(campaign.user_id.clone());
    let mut sendable = Vec::new();
    for log in db::message_logs::get_pending(&state.pool, id).await? {
        let contacts = db::contacts::find_by_phone(&state.pool, &user_id, &log.client_phone).await?;
        if !contacts.iter().any(|c| c.is_unsubscribed()) {
            sendable.push(log);
            continue;
        }
        if db::message_logs::mark_blocked(&state.pool, &MessageLogId(log.id.clone())).await? {
            publish_message(state, id, &log, MessageStatus::Blocked, None);
        }
    }
    Ok(sendable)
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageStatusCallback {
    pub log_id: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub error: Option<String>,
}

/// エンジンからの1通分の結果。ログがまだ `pending` の場合だけ反映する。
pub async fn record_message_status(
    state: &AppState,
    callback: &MessageStatusCallback,
) -> Result<bool, AppError> {
    let log_id = MessageLogId(callback.log_id.clone());
    let log = db::message_logs::get_log(&state.pool, &log_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message log {log_id}")))?;
    let campaign_id = CampaignId(log.campaign_id.clone());

    let (updated, error) = match callback.status {
        MessageStatus::Sent => {
            let updated = db::message_logs::mark_sent(&state.pool, &log_id).await?;
            if updated {
                db::campaigns::increment_sent(&state.pool, &campaign_id).await?;
            }
            (updated, None)
        }
        MessageStatus::Failed => {
            let error = callback
                .error
                .clone()
                .unwrap_or_else(|| "delivery failed".into());
            let updated = db::message_logs::mark_failed(&state.pool, &log_id, &error).await?;
            if updated {
                db::campaigns::increment_failed(&state.pool, &campaign_id).await?;
            }
            (updated, Some(error))
        }
        other => {
            return Err(AppError::PreconditionFailed(format!(
                "unsupported callback status: {other}"
            )));
        }
    };
    if !updated {
        return Ok(false);
    }
    publish_message(state, &campaign_id, &log, callback.status, error);

    let counts = db::message_logs::count_by_status(&state.pool, &campaign_id).await?;
    if counts.pending == 0
        && db::campaigns::transition(&state.pool, &campaign_id, CampaignStatus::Completed).await?
    {
        tracing::info!(%campaign_id, "scheduled campaign completed");
    }
    publish_campaign(state, &campaign_id).await;
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CampaignStatusReply {
    pub status: CampaignStatus,
    pub should_continue: bool,
}

pub async fn campaign_status(
    state: &AppState,
    campaign_id: &CampaignId,
) -> Result<CampaignStatusReply, AppError> {
    let campaign = db::campaigns::get_campaign(&state.pool, campaign_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("campaign {campaign_id}")))?;
    let status = campaign.status();
    Ok(CampaignStatusReply {
        status,
        should_continue: status == CampaignStatus::InProgress,
    })
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use super::*;
    use crate::db::campaigns::{NewCampaign, NewMessageLog};
    use crate::storage::Media;
    use crate::testing::TestState;
    use crate::types::InstanceStatus;

    async fn scheduled(t: &TestState, pending: usize) -> CampaignId {
        let instance = db::instances::get_instance_for_user(&t.state.pool, &t.user.user_id)
            .await
            .unwrap()
            .unwrap();
        let logs: Vec<_> = (0..pending)
            .map(|i| NewMessageLog {
                position: i as i64,
                client_name: format!("Cliente {i}"),
                client_phone: format!("55119{i:08}"),
                message: format!("Oi Cliente {i}"),
                message_variation_index: 0,
                status: MessageStatus::Pending,
            })
            .collect();
        db::campaigns::create_campaign_with_logs(
            &t.state.pool,
            &NewCampaign {
                user_id: t.user.user_id.clone(),
                instance_id: InstanceId(instance.id),
                campaign_name: "Agendada".into(),
                message_variations: vec!["Oi {nome}".into()],
                target_tags: Vec::new(),
                status: CampaignStatus::Scheduled,
                scheduled_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            },
            &logs,
            &[],
        )
        .await
        .unwrap()
    }

    async fn status_of(t: &TestState, id: &CampaignId) -> CampaignStatus {
        db::campaigns::get_campaign(&t.state.pool, id)
            .await
            .unwrap()
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn dispatches_only_pending_logs() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 5).await;
        let logs = db::message_logs::get_logs(&t.state.pool, &id).await.unwrap();
        for log in &logs[..3] {
            db::message_logs::mark_sent(&t.state.pool, &MessageLogId(log.id.clone()))
                .await
                .unwrap();
        }

        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.dispatched, 1);

        let batches = t.workflow.batches();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.contacts.len(), 2);
        assert_eq!(batch.contacts[0].log_id, logs[3].id);
        assert_eq!(batch.message, "Oi {nome}");
        assert_eq!(batch.callback_url, "http://zapflow.test/callbacks/message-status");
        assert_eq!(
            batch.status_url,
            format!("http://zapflow.test/callbacks/campaigns/{id}/status")
        );
        assert!(batch.media.is_none());
        assert_eq!(status_of(&t, &id).await, CampaignStatus::InProgress);

        // 同じキャンペーンを二度起動しない
        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(t.workflow.batches().len(), 1);
    }

    #[tokio::test]
    async fn stored_media_is_attached() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 1).await;
        t.media.insert(
            &id,
            Media {
                data: b"hello".to_vec(),
                content_type: "image/png".into(),
            },
        );
        sweep(&t.state, Utc::now()).await.unwrap();
        let media = t.workflow.batches()[0].media.clone().unwrap();
        assert_eq!(media.base64, "aGVsbG8=");
        assert_eq!(media.mimetype, "image/png");
    }

    #[tokio::test]
    async fn disconnected_instance_fails_campaign() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 2).await;
        let instance = db::instances::get_instance_for_user(&t.state.pool, &t.user.user_id)
            .await
            .unwrap()
            .unwrap();
        db::instances::update_status(
            &t.state.pool,
            &InstanceId(instance.id),
            InstanceStatus::Disconnected,
            None,
        )
        .await
        .unwrap();

        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&t, &id).await, CampaignStatus::Failed);
        assert!(t.workflow.batches().is_empty());
    }

    #[tokio::test]
    async fn nothing_pending_completes_immediately() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 0).await;
        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(status_of(&t, &id).await, CampaignStatus::Completed);
        assert!(t.workflow.batches().is_empty());
    }

    #[tokio::test]
    async fn opted_out_contact_is_never_handed_to_the_workflow_engine() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 2).await;
        db::contacts::unsubscribe_phone(&t.state.pool, &t.user.user_id, "5511900000000")
            .await
            .unwrap();

        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.dispatched, 1);
        let phones: Vec<_> = t.workflow.batches()[0]
            .contacts
            .iter()
            .map(|c| c.phone.clone())
            .collect();
        assert_eq!(phones, vec!["5511900000001"]);

        let counts = db::message_logs::count_by_status(&t.state.pool, &id)
            .await
            .unwrap();
        assert_eq!((counts.blocked, counts.pending), (1, 1));
    }

    #[tokio::test]
    async fn all_recipients_opted_out_completes_without_dispatch() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 1).await;
        db::contacts::unsubscribe_phone(&t.state.pool, &t.user.user_id, "5511900000000")
            .await
            .unwrap();

        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.completed, 1);
        assert!(t.workflow.batches().is_empty());
        assert_eq!(status_of(&t, &id).await, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn workflow_failure_fails_campaign() {
        let t = TestState::connected().await;
        t.workflow.fail_next();
        let id = scheduled(&t, 2).await;
        let report = sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(status_of(&t, &id).await, CampaignStatus::Failed);
    }

    #[tokio::test]
    async fn missing_workflow_engine_fails_campaign() {
        let mut t = TestState::connected().await;
        t.state.workflow = None;
        let id = scheduled(&t, 1).await;
        sweep(&t.state, Utc::now()).await.unwrap();
        assert_eq!(status_of(&t, &id).await, CampaignStatus::Failed);
    }

    #[tokio::test]
    async fn callbacks_complete_the_campaign() {
        let t = TestState::connected().await;
        let id = scheduled(&t, 2).await;
        sweep(&t.state, Utc::now()).await.unwrap();
        let logs = db::message_logs::get_logs(&t.state.pool, &id).await.unwrap();

        let sent = MessageStatusCallback {
            log_id: logs[0].id.clone(),
            status: MessageStatus::Sent,
            error: None,
        };
        assert!(record_message_status(&t.state, &sent).await.unwrap());
        // 重複したコールバックはカウントしない
        assert!(!record_message_status(&t.state, &sent).await.unwrap());
        assert_eq!(
            campaign_status(&t.state, &id).await.unwrap(),
            CampaignStatusReply {
                status: CampaignStatus::InProgress,
                should_continue: true
            }
        );

        let failed = MessageStatusCallback {
            log_id: logs[1].id.clone(),
            status: MessageStatus::Failed,
            error: Some("HTTP 400".into()),
        };
        assert!(record_message_status(&t.state, &failed).await.unwrap());

        let row = db::campaigns::get_campaign(&t.state.pool, &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status(), CampaignStatus::Completed);
        assert_eq!((row.sent_count, row.failed_count), (1, 1));
        assert!(!campaign_status(&t.state, &id).await.unwrap().should_continue);
    }

    #[tokio::test]
    async fn unknown_log_is_not_found() {
        let t = TestState::connected().await;
        let err = record_message_status(
            &t.state,
            &MessageStatusCallback {
                log_id: "missing".into(),
                status: MessageStatus::Sent,
                error: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
