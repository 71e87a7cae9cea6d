mod ai;
mod billing;
mod callbacks;
mod campaigns;
mod captcha;
mod contacts;
mod webhooks;
mod whatsapp;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use callbacks::SECRET_HEADER;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .merge(contacts::routes())
        .merge(campaigns::routes())
        .merge(whatsapp::routes())
        .merge(billing::routes())
        .merge(ai::routes());

    Router::new()
        .nest("/v1", api)
        .merge(webhooks::public_routes())
        .merge(callbacks::public_routes())
        .merge(captcha::public_routes())
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
