use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: String,
    /// 外部から到達可能なこのサーバのベースURL（ワークフローエンジンへのコールバック先）
    pub public_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    /// 認証基盤の REST エンドポイント（`{auth_url}/user` でトークンを検証する）
    pub auth_url: String,
    pub auth_api_key: String,
    /// 1件ずつ送信する中継 webhook
    pub delivery_webhook_url: Option<String>,
    /// 予約キャンペーンをまとめて渡すワークフローエンジンの webhook
    pub workflow_webhook_url: Option<String>,
    /// WhatsApp ゲートウェイ（インスタンス管理 API）
    pub gateway_api_url: Option<String>,
    pub gateway_api_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_api_base: String,
    pub ai_api_url: String,
    pub ai_api_key: Option<String>,
    pub ai_model: String,
    pub recaptcha_secret: Option<String>,
    /// コールバック・スイーパ起動に要求する共有シークレット
    pub callback_secret: Option<String>,
    /// 受信者ごとの送信間隔
    pub send_delay: Duration,
    pub max_recipients: usize,
    pub trial_days: i64,
    /// サーバ側でアクセス判定キャッシュを信用する期間
    pub access_cache_ttl: Duration,
    /// 設定時のみプロセス内でスイーパを定期実行する
    pub sweeper_interval: Option<Duration>,
}

fn var_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let listen_addr = env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:zapflow.db?mode=rwc".into()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| format!("http://{listen_addr}"))
                .trim_end_matches('/')
                .to_string(),
            listen_addr,
            s3_bucket: env::var("S3_BUCKET").unwrap_or_else(|_| "zapflow".into()),
            s3_endpoint: var_opt("S3_ENDPOINT"),
            s3_region: env::var("S3_REGION").unwrap_or_else(|_| "auto".into()),
            auth_url: env::var("AUTH_URL")
                .unwrap_or_else(|_| "http://localhost:54321/auth/v1".into())
                .trim_end_matches('/')
                .to_string(),
            auth_api_key: env::var("AUTH_API_KEY").unwrap_or_default(),
            delivery_webhook_url: var_opt("DELIVERY_WEBHOOK_URL"),
            workflow_webhook_url: var_opt("WORKFLOW_WEBHOOK_URL"),
            gateway_api_url: var_opt("GATEWAY_API_URL").map(|u| u.trim_end_matches('/').into()),
            gateway_api_key: var_opt("GATEWAY_API_KEY"),
            stripe_secret_key: var_opt("STRIPE_SECRET_KEY"),
            stripe_price_id: var_opt("STRIPE_PRICE_ID"),
            stripe_api_base: env::var("STRIPE_API_BASE")
                .unwrap_or_else(|_| "https://api.stripe.com/v1".into()),
            ai_api_url: env::var("AI_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".into()),
            ai_api_key: var_opt("AI_API_KEY"),
            ai_model: env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            recaptcha_secret: var_opt("RECAPTCHA_SECRET"),
            callback_secret: var_opt("CALLBACK_SECRET"),
            send_delay: Duration::from_millis(var_parse("SEND_DELAY_MS", 1000)),
            max_recipients: var_parse("MAX_RECIPIENTS", 1000),
            trial_days: var_parse("TRIAL_DAYS", 7),
            access_cache_ttl: Duration::from_secs(var_parse("ACCESS_CACHE_TTL_SECS", 300)),
            sweeper_interval: var_opt("SWEEPER_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .filter(|secs: &u64| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    /// テスト用の既定値（外部連携はすべて未設定）
    pub fn for_tests() -> Self {
        Self {
            database_url: "sqlite::memory:".into(),
            listen_addr: "127.0.0.1:0".into(),
            public_url: "http://zapflow.test".into(),
            s3_bucket: "zapflow".into(),
            s3_endpoint: None,
            s3_region: "auto".into(),
            auth_url: "http://auth.test/auth/v1".into(),
            auth_api_key: String::new(),
            delivery_webhook_url: None,
            workflow_webhook_url: None,
            gateway_api_url: None,
            gateway_api_key: None,
            stripe_secret_key: None,
            stripe_price_id: None,
            stripe_api_base: "https://api.stripe.com/v1".into(),
            ai_api_url: "http://ai.test/v1/chat/completions".into(),
            ai_api_key: None,
            ai_model: "test-model".into(),
            recaptcha_secret: None,
            callback_secret: Some("test-secret".into()),
            send_delay: Duration::ZERO,
            max_recipients: 1000,
            trial_days: 7,
            access_cache_ttl: Duration::from_secs(300),
            sweeper_interval: None,
        }
    }
}
