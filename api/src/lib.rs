pub mod access;
pub mod ai;
pub mod auth;
pub mod billing;
pub mod campaign;
pub mod captcha;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gateway;
pub mod routes;
pub mod storage;
pub mod types;

#[cfg(all(test, not(feature = "postgres")))]
pub(crate) mod testing;

use std::sync::Arc;

use access::AccessGate;
use ai::AiClient;
use auth::IdentityProvider;
use billing::BillingProvider;
use campaign::runs::CampaignRuns;
use config::AppConfig;
use events::CampaignEvents;
use gateway::delivery::DeliveryGateway;
use gateway::instance::InstanceGateway;
use gateway::workflow::WorkflowEngine;
use storage::MediaStore;

/// Application state shared across all handlers.
///
/// 外部連携のうち任意のものは `Option`。未設定のまま使われた場合は `AppError::Config`。
#[derive(Clone)]
pub struct AppState {
    pub pool: db::Db,
    pub config: AppConfig,
    pub identity: Arc<dyn IdentityProvider>,
    pub delivery: Option<Arc<dyn DeliveryGateway>>,
    pub instances: Option<Arc<dyn InstanceGateway>>,
    pub workflow: Option<Arc<dyn WorkflowEngine>>,
    pub billing: Option<Arc<dyn BillingProvider>>,
    pub ai: Option<Arc<AiClient>>,
    pub media: Arc<dyn MediaStore>,
    pub access: AccessGate,
    pub events: CampaignEvents,
    pub runs: CampaignRuns,
}
