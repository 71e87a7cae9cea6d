//! テスト用のインメモリ DB と外部連携の差し替え。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::AppState;
use crate::access::AccessGate;
use crate::auth::{AuthenticatedUser, IdentityProvider};
use crate::billing::{ActiveSubscription, BillingProvider, CheckoutCustomer};
use crate::campaign::runs::CampaignRuns;
use crate::config::AppConfig;
use crate::db::campaigns::{NewCampaign, NewMessageLog};
use crate::db::{self, Db};
use crate::error::AppError;
use crate::events::CampaignEvents;
use crate::gateway::delivery::{DeliveryGateway, OutgoingMessage};
use crate::gateway::instance::{
    ConnectionState, CreatedInstance, InstanceGateway, WhatsAppContact, WhatsAppGroup,
};
use crate::gateway::workflow::{CampaignBatch, WorkflowEngine};
use crate::storage::{Media, MediaStore};
use crate::types::{CampaignId, CampaignStatus, InstanceId, InstanceStatus, MessageStatus, UserId};

pub(crate) const INSTANCE_NAME: &str = "zf_test";
pub(crate) const TOKEN: &str = "test-token";
pub(crate) const USER_ID: &str = "user-1";

/// 接続を1本に固定したインメモリ SQLite（接続ごとに別 DB になるため）
pub(crate) async fn memory_pool() -> Db {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

pub(crate) async fn connected_instance(pool: &Db, user_id: &UserId) -> InstanceId {
    connected_instance_named(pool, user_id, INSTANCE_NAME).await
}

pub(crate) async fn connected_instance_named(
    pool: &Db,
    user_id: &UserId,
    instance_name: &str,
) -> InstanceId {
    let id = db::instances::upsert_pending_instance(pool, user_id, instance_name, "instance-key", None)
        .await
        .unwrap();
    db::instances::update_status(pool, &id, InstanceStatus::Connected, Some("5565999990000"))
        .await
        .unwrap();
    id
}

pub(crate) async fn campaign_with_pending(
    pool: &Db,
    user_id: &UserId,
    instance_id: &InstanceId,
    n: usize,
) -> CampaignId {
    let logs: Vec<_> = (0..n)
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
        pool,
        &NewCampaign {
            user_id: user_id.clone(),
            instance_id: instance_id.clone(),
            campaign_name: "Teste".into(),
            message_variations: vec!["Oi {nome}".into()],
            target_tags: Vec::new(),
            status: CampaignStatus::InProgress,
            scheduled_at: None,
        },
        &logs,
        &[],
    )
    .await
    .unwrap()
}

/// 配信呼び出しを記録する。`fail_on` の位置（0 始まり）は HTTP 500 で失敗させる。
#[derive(Default)]
pub(crate) struct FakeDelivery {
    calls: Mutex<Vec<OutgoingMessage>>,
    fail_on: Vec<usize>,
    interrupt: Mutex<Option<(Db, CampaignId, usize, CampaignStatus)>>,
    hold: Mutex<Option<(usize, Arc<CallGate>)>>,
}

/// 止めた呼び出しの進入通知と解放
#[derive(Default)]
pub(crate) struct CallGate {
    pub(crate) entered: tokio::sync::Notify,
    pub(crate) release: tokio::sync::Notify,
}

impl FakeDelivery {
    pub(crate) fn failing_on(positions: &[usize]) -> Self {
        Self {
            fail_on: positions.to_vec(),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<OutgoingMessage> {
        self.calls.lock().unwrap().clone()
    }

    /// `n` 回目の呼び出しの直後にキャンペーンの状態を変える（利用者の操作を模す）
    pub(crate) fn interrupt_after(
        &self,
        pool: &Db,
        campaign_id: &CampaignId,
        n: usize,
        status: CampaignStatus,
    ) {
        *self.interrupt.lock().unwrap() = Some((pool.clone(), campaign_id.clone(), n, status));
    }

    /// `n` 回目の呼び出しを `release` されるまで返さない（応答の遅い中継を模す）
    pub(crate) fn hold_call(&self, n: usize) -> Arc<CallGate> {
        let gate = Arc::new(CallGate::default());
        *self.hold.lock().unwrap() = Some((n, gate.clone()));
        gate
    }
}

#[async_trait]
impl DeliveryGateway for FakeDelivery {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<(), String> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(message.clone());
            calls.len()
        };
        let interrupt = self.interrupt.lock().unwrap().clone();
        if let Some((pool, campaign_id, after, status)) = interrupt
            && after == n
        {
            db::campaigns::transition(&pool, &campaign_id, status)
                .await
                .unwrap();
        }
        let hold = self.hold.lock().unwrap().clone();
        if let Some((at, gate)) = hold
            && at == n
        {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail_on.contains(&(n - 1)) {
            return Err("HTTP 500".into());
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeWorkflow {
    batches: Mutex<Vec<CampaignBatch>>,
    fail: Mutex<bool>,
}

impl FakeWorkflow {
    pub(crate) fn batches(&self) -> Vec<CampaignBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn fail_next(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

#[async_trait]
impl WorkflowEngine for FakeWorkflow {
    async fn dispatch(&self, batch: &CampaignBatch) -> Result<(), String> {
        if std::mem::take(&mut *self.fail.lock().unwrap()) {
            return Err("HTTP 503".into());
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryMedia {
    items: Mutex<HashMap<CampaignId, Media>>,
    fail: Mutex<bool>,
}

impl MemoryMedia {
    pub(crate) fn get(&self, campaign_id: &CampaignId) -> Option<Media> {
        self.items.lock().unwrap().get(campaign_id).cloned()
    }

    pub(crate) fn fail_next_put(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub(crate) fn insert(&self, campaign_id: &CampaignId, media: Media) {
        self.items
            .lock()
            .unwrap()
            .insert(campaign_id.clone(), media);
    }
}

#[async_trait]
impl MediaStore for MemoryMedia {
    async fn put_campaign_media(
        &self,
        campaign_id: &CampaignId,
        media: Media,
    ) -> Result<(), String> {
        if std::mem::take(&mut *self.fail.lock().unwrap()) {
            return Err("bucket unavailable".into());
        }
        self.insert(campaign_id, media);
        Ok(())
    }

    async fn get_campaign_media(&self, campaign_id: &CampaignId) -> Result<Option<Media>, String> {
        Ok(self.get(campaign_id))
    }
}

#[derive(Default)]
pub(crate) struct FakeBilling {
    customer: Option<String>,
    subscription: Option<ActiveSubscription>,
    fail: bool,
}

impl FakeBilling {
    pub(crate) fn with_subscription(customer: &str, subscription: ActiveSubscription) -> Self {
        Self {
            customer: Some(customer.into()),
            subscription: Some(subscription),
            fail: false,
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn check(&self) -> Result<(), AppError> {
        if self.fail {
            return Err(AppError::BadGateway("billing unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingProvider for FakeBilling {
    async fn find_customer(&self, _email: &str) -> Result<Option<String>, AppError> {
        self.check()?;
        Ok(self.customer.clone())
    }

    async fn active_subscription(
        &self,
        _customer_id: &str,
    ) -> Result<Option<ActiveSubscription>, AppError> {
        self.check()?;
        Ok(self.subscription.clone())
    }

    async fn checkout_session(
        &self,
        customer: CheckoutCustomer,
        _success_url: &str,
        _cancel_url: &str,
    ) -> Result<String, AppError> {
        self.check()?;
        Ok(match customer {
            CheckoutCustomer::Existing(id) => format!("https://checkout.test/{id}"),
            CheckoutCustomer::Email(_) => "https://checkout.test/new".into(),
        })
    }

    async fn portal_session(&self, customer_id: &str, _return_url: &str) -> Result<String, AppError> {
        self.check()?;
        Ok(format!("https://portal.test/{customer_id}"))
    }
}

/// `TOKEN` だけを受け付ける
pub(crate) struct FakeIdentity;

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        if token != TOKEN {
            return Err(AppError::Unauthorized("invalid or expired token".into()));
        }
        Ok(test_user())
    }
}

pub(crate) fn test_user() -> AuthenticatedUser {
    AuthenticatedUser {
        user_id: UserId(USER_ID.into()),
        email: Some("ana@example.com".into()),
        token: TOKEN.into(),
    }
}

pub(crate) struct FakeInstances {
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) groups: Vec<WhatsAppGroup>,
    pub(crate) contacts: Vec<WhatsAppContact>,
    pub(crate) logged_out: Mutex<bool>,
}

impl Default for FakeInstances {
    fn default() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
            groups: vec![WhatsAppGroup {
                id: "1203@g.us".into(),
                subject: "Clientes".into(),
                participants: vec!["5511911111111".into(), "5511922222222".into()],
            }],
            contacts: vec![
                WhatsAppContact {
                    phone: "5511911111111".into(),
                    name: Some("Bruno".into()),
                },
                WhatsAppContact {
                    phone: "5511922222222".into(),
                    name: None,
                },
            ],
            logged_out: Mutex::new(false),
        }
    }
}

#[async_trait]
impl InstanceGateway for FakeInstances {
    async fn create_instance(&self, instance_name: &str) -> Result<CreatedInstance, AppError> {
        Ok(CreatedInstance {
            api_key: format!("key-{instance_name}"),
            qr_code: Some("data:image/png;base64,qr".into()),
        })
    }

    async fn connect(&self, _instance_name: &str) -> Result<Option<String>, AppError> {
        Ok(Some("data:image/png;base64,qr2".into()))
    }

    async fn connection_state(&self, _instance_name: &str) -> Result<ConnectionState, AppError> {
        Ok(*self.state.lock().unwrap())
    }

    async fn owner_phone(&self, _instance_name: &str) -> Result<Option<String>, AppError> {
        Ok(Some("5565999990000".into()))
    }

    async fn logout(&self, _instance_name: &str) -> Result<(), AppError> {
        *self.logged_out.lock().unwrap() = true;
        Ok(())
    }

    async fn fetch_groups(&self, _instance_name: &str) -> Result<Vec<WhatsAppGroup>, AppError> {
        Ok(self.groups.clone())
    }

    async fn fetch_contacts(&self, _instance_name: &str) -> Result<Vec<WhatsAppContact>, AppError> {
        Ok(self.contacts.clone())
    }
}

/// 差し替え済みの状態と、その差し替え先への参照
pub(crate) struct TestState {
    pub(crate) state: AppState,
    pub(crate) user: AuthenticatedUser,
    pub(crate) delivery: Arc<FakeDelivery>,
    pub(crate) workflow: Arc<FakeWorkflow>,
    pub(crate) media: Arc<MemoryMedia>,
    pub(crate) instances: Arc<FakeInstances>,
}

impl TestState {
    /// WhatsApp 未接続のユーザ
    pub(crate) async fn new() -> Self {
        Self::build(FakeDelivery::default()).await
    }

    pub(crate) async fn connected() -> Self {
        Self::with_delivery(FakeDelivery::default()).await
    }

    pub(crate) async fn with_delivery(delivery: FakeDelivery) -> Self {
        let t = Self::build(delivery).await;
        connected_instance(&t.state.pool, &t.user.user_id).await;
        t
    }

    async fn build(delivery: FakeDelivery) -> Self {
        let config = AppConfig::for_tests();
        let delivery = Arc::new(delivery);
        let workflow = Arc::new(FakeWorkflow::default());
        let media = Arc::new(MemoryMedia::default());
        let instances = Arc::new(FakeInstances::default());
        let state = AppState {
            pool: memory_pool().await,
            access: AccessGate::new(config.access_cache_ttl, config.trial_days),
            config,
            identity: Arc::new(FakeIdentity),
            delivery: Some(delivery.clone()),
            instances: Some(instances.clone()),
            workflow: Some(workflow.clone()),
            billing: None,
            ai: None,
            media: media.clone(),
            events: CampaignEvents::new(),
            runs: CampaignRuns::default(),
        };
        Self {
            state,
            user: test_user(),
            delivery,
            workflow,
            media,
            instances,
        }
    }

    pub(crate) fn router(&self) -> axum::Router {
        crate::routes::build_router(self.state.clone())
    }
}

/// ルータに1リクエスト送り、状態コードと JSON 本文（JSON でなければ `Null`）を返す
pub(crate) async fn send(
    router: axum::Router,
    req: axum::http::Request<axum::body::Body>,
) -> (axum::http::StatusCode, serde_json::Value) {
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let resp = router.oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (
        status,
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null),
    )
}

/// `TOKEN` 付きのリクエスト
pub(crate) fn authed(
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> axum::http::Request<axum::body::Body> {
    let req = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TOKEN}"));
    match body {
        Some(json) => req
            .header("content-type", "application/json")
            .body(axum::body::Body::from(json.to_string()))
            .unwrap(),
        None => req.body(axum::body::Body::empty()).unwrap(),
    }
}
