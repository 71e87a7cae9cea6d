use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::AppError;

const VERIFY_URL: &str = "https://www.google.com/recaptcha/api/siteverify";
/// reCAPTCHA v3 のスコアしきい値
pub const MIN_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CaptchaResult {
    pub success: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default, rename = "error-codes", skip_serializing_if = "Vec::is_empty")]
    pub error_codes: Vec<String>,
}

impl CaptchaResult {
    /// スコアが返らない（v2）場合は `success` だけで判定する
    pub fn passed(&self) -> bool {
        self.success && self.score.is_none_or(|score| score >= MIN_SCORE)
    }
}

pub struct CaptchaVerifier {
    client: reqwest::Client,
    secret: String,
}

impl CaptchaVerifier {
    pub fn from_config(config: &AppConfig) -> Option<Self> {
        Some(Self {
            client: reqwest::Client::new(),
            secret: config.recaptcha_secret.clone()?,
        })
    }

    pub async fn verify(&self, token: &str) -> Result<CaptchaResult, AppError> {
        let resp = self
            .client
            .post(VERIFY_URL)
            .form(&[("secret", self.secret.as_str()), ("response", token)])
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("captcha request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "captcha provider returned {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::BadGateway(format!("invalid captcha response: {e}")))
    }
}
