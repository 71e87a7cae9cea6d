use std::sync::Arc;

use tokio::time::sleep;
use zapflow_api::AppState;
use zapflow_api::access::AccessGate;
use zapflow_api::ai::AiClient;
use zapflow_api::auth::HttpIdentityProvider;
use zapflow_api::billing::{BillingProvider, StripeClient};
use zapflow_api::campaign::runs::CampaignRuns;
use zapflow_api::campaign::sweeper;
use zapflow_api::config::AppConfig;
use zapflow_api::db;
use zapflow_api::events::CampaignEvents;
use zapflow_api::gateway::delivery::{DeliveryGateway, WebhookDelivery};
use zapflow_api::gateway::instance::{EvolutionGateway, InstanceGateway};
use zapflow_api::gateway::workflow::{WebhookWorkflow, WorkflowEngine};
use zapflow_api::routes::build_router;
use zapflow_api::storage::S3Storage;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zapflow_api=debug,tower_http=debug".parse().unwrap()),
        )
        .init();

    let config = AppConfig::from_env();
    tracing::info!("starting server on {}", config.listen_addr);

    let pool = db::connect(&config.database_url)
        .await
        .expect("failed to connect to database");
    db::migrate(&pool).await.expect("failed to run migrations");

    let delivery = config
        .delivery_webhook_url
        .clone()
        .map(|url| Arc::new(WebhookDelivery::new(url)) as Arc<dyn DeliveryGateway>);
    let instances = config
        .gateway_api_url
        .clone()
        .zip(config.gateway_api_key.clone())
        .map(|(url, key)| Arc::new(EvolutionGateway::new(url, key)) as Arc<dyn InstanceGateway>);
    let workflow = config
        .workflow_webhook_url
        .clone()
        .map(|url| {
            Arc::new(WebhookWorkflow::new(url, config.callback_secret.clone()))
                as Arc<dyn WorkflowEngine>
        });
    let billing =
        StripeClient::from_config(&config).map(|c| Arc::new(c) as Arc<dyn BillingProvider>);
    let ai = AiClient::from_config(&config).map(Arc::new);
    for (name, configured) in [
        ("delivery relay", delivery.is_some()),
        ("WhatsApp gateway", instances.is_some()),
        ("workflow engine", workflow.is_some()),
        ("billing", billing.is_some()),
        ("AI provider", ai.is_some()),
    ] {
        if !configured {
            tracing::warn!("{name} is not configured");
        }
    }

    let state = AppState {
        pool,
        identity: Arc::new(HttpIdentityProvider::new(&config)),
        delivery,
        instances,
        workflow,
        billing,
        ai,
        media: Arc::new(S3Storage::new(&config).await),
        access: AccessGate::new(config.access_cache_ttl, config.trial_days),
        events: CampaignEvents::new(),
        runs: CampaignRuns::default(),
        config: config.clone(),
    };

    if let Some(interval) = config.sweeper_interval {
        let sweep_state = state.clone();
        tokio::spawn(async move {
            loop {
                match sweeper::sweep(&sweep_state, chrono::Utc::now()).await {
                    Ok(report) if report.due > 0 => {
                        tracing::info!(?report, "scheduled campaigns swept");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "sweeper run failed");
                    }
                }
                sleep(interval).await;
            }
        });
    }

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind");
    tracing::info!("listening on {}", config.listen_addr);
    axum::serve(listener, app).await.expect("server error");
}
