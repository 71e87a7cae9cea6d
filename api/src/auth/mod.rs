use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::Deserialize;

use crate::AppState;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::types::UserId;

/// Authenticated user extracted from the `Authorization: Bearer <token>` header.
///
/// トークンの検証は外部の認証基盤に委ねる。サーバ側ではセッションを保持しない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub email: Option<String>,
    /// 課金プロバイダへの問い合わせなどに転送するため保持
    pub token: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError>;
}

/// `GET {auth_url}/user` でアクセストークンを検証する認証基盤クライアント。
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    user_url: String,
    api_key: String,
}

impl HttpIdentityProvider {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            user_url: format!("{}/user", config.auth_url),
            api_key: config.auth_api_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct IdentityUser {
    id: String,
    email: Option<String>,
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let resp = self
            .client
            .get(&self.user_url)
            .bearer_auth(token)
            .header("apikey", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("identity request failed: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AppError::Unauthorized("invalid or expired token".into()));
        }
        if !status.is_success() {
            return Err(AppError::BadGateway(format!(
                "identity provider returned {status}"
            )));
        }

        let user: IdentityUser = resp
            .json()
            .await
            .map_err(|e| AppError::BadGateway(format!("invalid identity response: {e}")))?;
        Ok(AuthenticatedUser {
            user_id: UserId(user.id),
            email: user.email,
            token: token.to_string(),
        })
    }
}

/// `Bearer ` 接頭辞を外したトークン。空なら `None`。
pub(crate) fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

impl FromRequestParts<AppState> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized("missing authorization header".into()))?;
        let token = bearer_token(header)
            .ok_or_else(|| AppError::Unauthorized("expected a bearer token".into()))?;

        state.identity.verify(token).await
    }
}
