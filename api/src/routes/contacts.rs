use std::collections::BTreeSet;

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use zapflow_common::import::{self, Row};
use zapflow_common::merge::{self, MergeCandidate, MergePlan};
use zapflow_common::phone;

use crate::AppState;
use crate::auth::AuthenticatedUser;
use crate::db;
use crate::db::contacts::NewContact;
use crate::db::models::ContactRow;
use crate::error::AppError;
use crate::types::{ContactId, ContactStatus, UserId};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/contacts", get(list_contacts).post(create_contact))
        .route("/contacts/tags", get(list_tags))
        .route("/contacts/import", post(import_contacts))
        .route("/contacts/duplicates", get(list_duplicates))
        .route("/contacts/merge", post(merge_duplicates))
        .route("/contacts/{id}", put(update_contact).delete(delete_contact))
}

#[derive(Deserialize)]
struct ListQuery {
    /// `?tag=a&tag=b` はいずれかのタグを持つ連絡先
    #[serde(default)]
    tag: Vec<String>,
    status: Option<ContactStatus>,
}

async fn list_contacts(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    axum_extra::extract::Query(query): axum_extra::extract::Query<ListQuery>,
) -> Result<Json<Vec<ContactRow>>, AppError> {
    let contacts = db::contacts::get_contacts(&state.pool, &auth.user_id, query.status).await?;
    let contacts = if query.tag.is_empty() {
        contacts
    } else {
        contacts
            .into_iter()
            .filter(|c| c.tags.iter().any(|t| query.tag.contains(t)))
            .collect()
    };
    Ok(Json(contacts))
}

#[derive(Deserialize)]
struct ContactBody {
    phone_number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    status: Option<ContactStatus>,
    /// `dd/mm/yyyy` または `yyyy-mm-dd`
    #[serde(default)]
    birthday: Option<String>,
}

impl ContactBody {
    fn into_new_contact(self) -> Result<NewContact, AppError> {
        let phone_number = phone::validate(&self.phone_number)?;
        let birthday = match self.birthday.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                import::parse_birthday(raw)
                    .ok_or_else(|| AppError::PreconditionFailed(format!("invalid birthday: {raw}")))?
                    .format("%Y-%m-%d")
                    .to_string(),
            ),
        };
        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            if !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        Ok(NewContact {
            phone_number,
            name: self
                .name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            tags,
            status: self.status.unwrap_or(ContactStatus::Active),
            birthday,
        })
    }
}

async fn load_contact(state: &AppState, user_id: &UserId, id: &ContactId) -> Result<ContactRow, AppError> {
    db::contacts::get_contact(&state.pool, user_id, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("contact {id}")))
}

async fn create_contact(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<ContactBody>,
) -> Result<Json<ContactRow>, AppError> {
    let contact = body.into_new_contact()?;
    if !db::contacts::find_by_phone(&state.pool, &auth.user_id, &contact.phone_number)
        .await?
        .is_empty()
    {
        return Err(AppError::Conflict(format!(
            "contact {} already exists",
            contact.phone_number
        )));
    }
    let id = db::contacts::create_contact(&state.pool, &auth.user_id, &contact).await?;
    Ok(Json(load_contact(&state, &auth.user_id, &id).await?))
}

async fn update_contact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
    Json(body): Json<ContactBody>,
) -> Result<Json<ContactRow>, AppError> {
    let id = ContactId(id);
    let existing = load_contact(&state, &auth.user_id, &id).await?;
    let mut contact = body.into_new_contact()?;
    // 配信停止は利用者の編集では解除しない
    if existing.is_unsubscribed() {
        contact.status = ContactStatus::Unsubscribed;
    }
    let clash = db::contacts::find_by_phone(&state.pool, &auth.user_id, &contact.phone_number)
        .await?
        .into_iter()
        .any(|c| c.id != existing.id);
    if clash {
        return Err(AppError::Conflict(format!(
            "contact {} already exists",
            contact.phone_number
        )));
    }
    db::contacts::update_contact(&state.pool, &auth.user_id, &id, &contact).await?;
    Ok(Json(load_contact(&state, &auth.user_id, &id).await?))
}

async fn delete_contact(
    State(state): State<AppState>,
    Path(id): Path<String>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = ContactId(id);
    if !db::contacts::delete_contact(&state.pool, &auth.user_id, &id).await? {
        return Err(AppError::NotFound(format!("contact {id}")));
    }
    Ok(Json(serde_json::json!({ "deleted": true })))
}

async fn list_tags(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<Vec<String>>, AppError> {
    let contacts = db::contacts::get_contacts(&state.pool, &auth.user_id, None).await?;
    let tags: BTreeSet<String> = contacts.into_iter().flat_map(|c| c.tags).collect();
    Ok(Json(tags.into_iter().collect()))
}

#[derive(Deserialize)]
struct ImportBody {
    rows: Vec<Row>,
}

async fn import_contacts(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
    Json(body): Json<ImportBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = import::parse_rows(&body.rows)?;
    let outcome =
        db::contacts::import_contacts(&state.pool, &auth.user_id, &report.contacts).await?;
    tracing::info!(
        user_id = %auth.user_id,
        inserted = outcome.inserted,
        updated = outcome.updated,
        rejected = report.rejected.len(),
        "contacts imported"
    );
    Ok(Json(serde_json::json!({
        "inserted": outcome.inserted,
        "updated": outcome.updated,
        "rejected": report.rejected,
    })))
}

/// 古い順の連絡先から統合計画を作る
async fn merge_plans(state: &AppState, user_id: &UserId) -> Result<(Vec<MergePlan>, Vec<ContactRow>), AppError> {
    let mut contacts = db::contacts::get_contacts(&state.pool, user_id, None).await?;
    contacts.reverse();
    let candidates: Vec<MergeCandidate> = contacts
        .iter()
        .map(|c| MergeCandidate {
            id: c.id.clone(),
            phone: c.phone_number.clone(),
            tags: c.tags.clone(),
        })
        .collect();
    Ok((merge::plan_merges(&candidates), contacts))
}

async fn list_duplicates(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<Vec<MergePlan>>, AppError> {
    let (plans, _) = merge_plans(&state, &auth.user_id).await?;
    Ok(Json(plans))
}

async fn merge_duplicates(
    State(state): State<AppState>,
    auth: AuthenticatedUser,
) -> Result<Json<serde_json::Value>, AppError> {
    let (plans, contacts) = merge_plans(&state, &auth.user_id).await?;
    let deleted = db::contacts::apply_merges(&state.pool, &auth.user_id, &plans).await?;

    // 統合で配信停止が消えないよう、停止済みを含むグループは残した側も停止にする
    for plan in &plans {
        let unsubscribed = contacts.iter().any(|c| {
            c.is_unsubscribed() && (c.id == plan.keep || plan.remove.contains(&c.id))
        });
        if unsubscribed {
            db::contacts::unsubscribe_phone(&state.pool, &auth.user_id, &plan.key).await?;
        }
    }
    tracing::info!(user_id = %auth.user_id, groups = plans.len(), deleted, "duplicate contacts merged");
    Ok(Json(serde_json::json!({
        "merged_groups": plans.len(),
        "deleted": deleted,
    })))
}
