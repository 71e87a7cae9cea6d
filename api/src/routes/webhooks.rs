//! WhatsApp ゲートウェイ（中継）からの通知。認証はなく、インスタンス名で利用者を引く。

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use zapflow_common::optout;

use crate::AppState;
use crate::db;
use crate::db::models::InstanceRow;
use crate::error::AppError;
use crate::gateway::instance::ConnectionState;
use crate::types::{InstanceId, InstanceStatus, UserId};

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/webhooks/optout", post(optout_webhook))
        .route("/webhooks/connection", post(connection_webhook))
}

async fn instance_by_name(state: &AppState, instance_name: &str) -> Result<InstanceRow, AppError> {
    db::instances::get_instance_by_name(&state.pool, instance_name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("instance {instance_name}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptOutBody {
    instance_name: String,
    sender: String,
    #[serde(default)]
    message: String,
}

async fn optout_webhook(
    State(state): State<AppState>,
    Json(body): Json<OptOutBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let instance = instance_by_name(&state, &body.instance_name).await?;
    let Some(keyword) = optout::matched_keyword(&body.message) else {
        return Ok(Json(serde_json::json!({ "success": true, "opted_out": false })));
    };
    let user_id = UserId(instance.user_id);
    let updated = db::contacts::unsubscribe_phone(&state.pool, &user_id, &body.sender).await?;
    tracing::info!(%user_id, keyword, updated, "contact opted out");
    Ok(Json(serde_json::json!({ "success": true, "opted_out": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionBody {
    instance_name: String,
    state: String,
}

async fn connection_webhook(
    State(state): State<AppState>,
    Json(body): Json<ConnectionBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let instance = instance_by_name(&state, &body.instance_name).await?;
    let status = match ConnectionState::parse(&body.state) {
        ConnectionState::Open => InstanceStatus::Connected,
        ConnectionState::Close => InstanceStatus::Disconnected,
        ConnectionState::Connecting => {
            return Ok(Json(serde_json::json!({ "success": true })));
        }
    };
    db::instances::update_status(&state.pool, &InstanceId(instance.id), status, None).await?;
    tracing::info!(instance_name = %body.instance_name, %status, "connection state reported");
    Ok(Json(serde_json::json!({ "success": true, "status": status })))
}

#[cfg(all(test, not(feature = "postgres")))]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};

    use crate::db;
    use crate::testing::{INSTANCE_NAME, TestState, send};

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn refusal_unsubscribes_every_variant() {
        let t = TestState::connected().await;
        let pool = &t.state.pool;
        let user = &t.user.user_id;
        for phone in ["5565999852826", "556599852826"] {
            sqlx::query("INSERT INTO contacts (id, user_id, phone_number, tags, status) VALUES (?, ?, ?, '[]', 'active')")
                .bind(phone)
                .bind(user.as_str())
                .bind(phone)
                .execute(pool)
                .await
                .unwrap();
        }

        let (status, body) = send(
            t.router(),
            post(
                "/webhooks/optout",
                json!({
                    "instanceName": INSTANCE_NAME,
                    "sender": "5565999852826@s.whatsapp.net",
                    "message": "❌ NÃO quero mais receber",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "opted_out": true }));
        let contacts = db::contacts::get_contacts(pool, user, None).await.unwrap();
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().all(|c| c.is_unsubscribed()));
    }

    #[tokio::test]
    async fn unknown_sender_is_recorded_as_unsubscribed() {
        let t = TestState::connected().await;
        let (_, body) = send(
            t.router(),
            post(
                "/webhooks/optout",
                json!({ "instanceName": INSTANCE_NAME, "sender": "5511977776666", "message": "Parar" }),
            ),
        )
        .await;
        assert_eq!(body["opted_out"], true);
        let found = db::contacts::find_by_phone(&t.state.pool, &t.user.user_id, "5511977776666")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].is_unsubscribed());
    }

    #[tokio::test]
    async fn ordinary_reply_and_unknown_instance() {
        let t = TestState::connected().await;
        let (_, body) = send(
            t.router(),
            post(
                "/webhooks/optout",
                json!({ "instanceName": INSTANCE_NAME, "sender": "5511977776666", "message": "Obrigado!" }),
            ),
        )
        .await;
        assert_eq!(body["opted_out"], false);
        assert!(
            db::contacts::get_contacts(&t.state.pool, &t.user.user_id, None)
                .await
                .unwrap()
                .is_empty()
        );

        let (status, _) = send(
            t.router(),
            post(
                "/webhooks/optout",
                json!({ "instanceName": "zf_nobody", "sender": "5511977776666", "message": "sair" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn connection_state_changes() {
        let t = TestState::connected().await;
        let (status, _) = send(
            t.router(),
            post("/webhooks/connection", json!({ "instanceName": INSTANCE_NAME, "state": "close" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let row = db::instances::get_instance_by_name(&t.state.pool, INSTANCE_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.is_connected());

        send(
            t.router(),
            post("/webhooks/connection", json!({ "instanceName": INSTANCE_NAME, "state": "open" })),
        )
        .await;
        let row = db::instances::get_instance_by_name(&t.state.pool, INSTANCE_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_connected());
        assert_eq!(row.phone_number.as_deref(), Some("5565999990000"));
    }
}
