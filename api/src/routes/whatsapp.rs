use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use zapflow_common::phone;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::db::contacts::NewContact;
use crate::db::models::InstanceRow;
use crate::error::AppError;
use crate::gateway::instance::{ConnectionState, InstanceGateway, WhatsAppGroup};
use crate::types::{ContactStatus, InstanceId, InstanceStatus, UserId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/whatsapp/connect", post(connect))
        .route("/whatsapp/status", get(status))
        .route("/whatsapp/disconnect", post(disconnect))
        .route("/whatsapp/groups", get(groups))
        .route("/whatsapp/import-contacts", post(import_contacts))
}

fn gateway(state: &AppState) -> Result<Arc<dyn InstanceGateway>, AppError> {
    state
        .instances
        .clone()
        .ok_or_else(|| AppError::Config("WhatsApp gateway is not configured".into()))
}

/// ゲートウェイ上のインスタンス名。ユーザごとに一意。
fn instance_name_for(user_id: &UserId) -> String {
    let id: String = user_id
        .as_str()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    format!("zf_{}", id.to_ascii_lowercase())
}

async fn instance_for(state: &AppState, user_id: &UserId) -> Result<InstanceRow, AppError> {
    db::instances::get_instance_for_user(&state.pool, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("WhatsApp instance not created".into()))
}

async fn connected_instance(state: &AppState, user_id: &UserId) -> Result<InstanceRow, AppError> {
    let instance = db::instances::get_instance_for_user(&state.pool, user_id).await?;
    instance
        .filter(|i| i.is_connected())
        .ok_or_else(|| AppError::PreconditionFailed("WhatsApp not connected".into()))
}

/// 初回はゲートウェイにインスタンスを作り、2回目以降は QR を再発行する。
async fn connect(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let gateway = gateway(&state)?;
    let (instance_name, qr_code) =
        match db::instances::get_instance_for_user(&state.pool, &auth.user_id).await? {
            Some(existing) => {
                let qr_code = gateway.connect(&existing.instance_name).await?;
                db::instances::update_qr_code(
                    &state.pool,
                    &InstanceId(existing.id),
                    qr_code.as_deref(),
                )
                .await?;
                (existing.instance_name, qr_code)
            }
            None => {
                let instance_name = instance_name_for(&auth.user_id);
                let created = gateway.create_instance(&instance_name).await?;
                db::instances::upsert_pending_instance(
                    &state.pool,
                    &auth.user_id,
                    &instance_name,
                    &created.api_key,
                    created.qr_code.as_deref(),
                )
                .await?;
                tracing::info!(user_id = %auth.user_id, %instance_name, "WhatsApp instance created");
                (instance_name, created.qr_code)
            }
        };
    Ok(Json(serde_json::json!({
        "instance_name": instance_name,
        "status": InstanceStatus::Pending,
        "qr_code": qr_code,
    })))
}

async fn status(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let Some(instance) = db::instances::get_instance_for_user(&state.pool, &auth.user_id).await?
    else {
        return Ok(Json(serde_json::json!({ "status": null, "qr_code": null })));
    };
    let gateway = gateway(&state)?;
    let id = InstanceId(instance.id.clone());
    match gateway.connection_state(&instance.instance_name).await? {
        ConnectionState::Open if !instance.is_connected() => {
            let owner = gateway.owner_phone(&instance.instance_name).await?;
            db::instances::update_status(&state.pool, &id, InstanceStatus::Connected, owner.as_deref())
                .await?;
            tracing::info!(user_id = %auth.user_id, "WhatsApp connected");
        }
        ConnectionState::Close if instance.is_connected() => {
            db::instances::update_status(&state.pool, &id, InstanceStatus::Disconnected, None)
                .await?;
            tracing::info!(user_id = %auth.user_id, "WhatsApp disconnected");
        }
        _ => {}
    }
    let instance = instance_for(&state, &auth.user_id).await?;
    Ok(Json(serde_json::json!({
        "status": instance.status,
        "phone_number": instance.phone_number,
        "qr_code": instance.qr_code,
    })))
}

async fn disconnect(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let gateway = gateway(&state)?;
    let instance = instance_for(&state, &auth.user_id).await?;
    gateway.logout(&instance.instance_name).await?;
    db::instances::update_status(
        &state.pool,
        &InstanceId(instance.id),
        InstanceStatus::Disconnected,
        None,
    )
    .await?;
    tracing::info!(user_id = %auth.user_id, "WhatsApp logged out");
    Ok(Json(serde_json::json!({ "status": InstanceStatus::Disconnected })))
}

async fn groups(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<Vec<WhatsAppGroup>>, AppError> {
    let gateway = gateway(&state)?;
    let instance = connected_instance(&state, &auth.user_id).await?;
    Ok(Json(gateway.fetch_groups(&instance.instance_name).await?))
}

/// アカウントの連絡先を取り込む。既存の番号（比較キー一致）と不正な番号は飛ばす。
async fn import_contacts(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let gateway = gateway(&state)?;
    let instance = connected_instance(&state, &auth.user_id).await?;
    let fetched = gateway.fetch_contacts(&instance.instance_name).await?;

    let mut known: HashSet<String> = db::contacts::get_contacts(&state.pool, &auth.user_id, None)
        .await?
        .iter()
        .map(|c| phone::normalize_for_comparison(&c.phone_number))
        .collect();
    let mut imported = 0;
    let mut skipped = 0;
    for contact in fetched {
        let Ok(phone_number) = phone::validate(&contact.phone) else {
            skipped += 1;
            continue;
        };
        if !known.insert(phone::normalize_for_comparison(&phone_number)) {
            skipped += 1;
            continue;
        }
        db::contacts::create_contact(
            &state.pool,
            &auth.user_id,
            &NewContact {
                phone_number,
                name: contact.name,
                tags: Vec::new(),
                status: ContactStatus::Active,
                birthday: None,
            },
        )
        .await?;
        imported += 1;
    }
    tracing::info!(user_id = %auth.user_id, imported, skipped, "WhatsApp contacts imported");
    Ok(Json(serde_json::json!({ "imported": imported, "skipped": skipped })))
}
