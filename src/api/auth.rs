use axum::{extract::State, Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ok, ApiResult, AppState, BearerToken};
use crate::auth::{self, AuthUser, TokenKind, TokenPair};
use crate::error::Error;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub revoked: usize,
}

pub async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> ApiResult<TokenPair> {
    // Argon2 verification is CPU-bound; keep it off the async workers.
    let users = state.rag.config.auth.users.clone();
    let account = tokio::task::spawn_blocking(move || {
        auth::authenticate(&users, &request.username, &request.password).cloned()
    })
    .await
    .map_err(|e| Error::Unknown(format!("password check failed: {}", e)))?
    .ok_or_else(|| Error::Unauthorized("invalid username or password".to_string()))?;
    let pair = state.rag.tokens.issue_pair(&account.id, account.role).await?;
    info!(user_id = %account.id, role = %account.role, "login");
    ok(pair)
}

pub async fn refresh(State(state): State<AppState>, Json(request): Json<RefreshRequest>) -> ApiResult<TokenPair> {
    ok(state.rag.tokens.refresh(&request.refresh_token).await?)
}

/// Revokes the presented access token and, when given, the refresh token.
pub async fn logout(
    State(state): State<AppState>,
    user: AuthUser,
    bearer: Option<Extension<BearerToken>>,
    body: Option<Json<LogoutRequest>>,
) -> ApiResult<LogoutResponse> {
    let mut revoked = 0;
    if let Some(Extension(BearerToken(token))) = bearer {
        state.rag.tokens.revoke(&token).await?;
        revoked += 1;
    }
    if let Some(refresh_token) = body.and_then(|Json(b)| b.refresh_token) {
        let claims = state.rag.tokens.verify(&refresh_token, TokenKind::Refresh).await?;
        if claims.sub != user.user_id {
            return Err(Error::Forbidden("refresh token belongs to another user".to_string()));
        }
        state.rag.tokens.revoke(&refresh_token).await?;
        revoked += 1;
    }
    info!(user_id = %user.user_id, revoked, "logout");
    ok(LogoutResponse { revoked })
}

pub async fn me(user: AuthUser) -> ApiResult<AuthUser> {
    ok(user)
}
