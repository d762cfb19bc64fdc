//! JWT access/refresh tokens with Redis-backed revocation.
//!
//! Revoked token ids are kept under `auth:blacklist:{jti}` until the token
//! would have expired anyway. Live refresh tokens per user are tracked in
//! the sorted set `auth:refresh:{user_id}`, scored by issue time, so the
//! oldest can be evicted once a user exceeds the configured maximum.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::rbac::Role;
use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::redis_backend::RedisManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub jti: String,
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

fn blacklist_key(jti: &str) -> String {
    format!("auth:blacklist:{}", jti)
}

fn refresh_set_key(user_id: &str) -> String {
    format!("auth:refresh:{}", user_id)
}

pub struct TokenManager {
    redis: Arc<RedisManager>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
    max_refresh_tokens: usize,
}

impl TokenManager {
    pub fn new(redis: Arc<RedisManager>, config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            redis,
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            max_refresh_tokens: config.max_refresh_tokens_per_user.max(1),
        }
    }

    fn sign(&self, user_id: &str, role: Role, kind: TokenKind, ttl: Duration) -> Result<(String, Claims)> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            role,
            jti: Uuid::new_v4().to_string(),
            kind,
            iat,
            exp: iat + ttl.as_secs() as i64,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        Ok((token, claims))
    }

    pub async fn issue_pair(&self, user_id: &str, role: Role) -> Result<TokenPair> {
        let (access_token, _) = self.sign(user_id, role, TokenKind::Access, self.access_ttl)?;
        let (refresh_token, refresh) = self.sign(user_id, role, TokenKind::Refresh, self.refresh_ttl)?;
        self.track_refresh(&refresh).await?;

        debug!(user_id, role = %role, "issued token pair");
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            expires_in: self.access_ttl.as_secs(),
        })
    }

    /// Drop refresh token ids whose tokens have expired by now.
    async fn prune_expired(&self, key: &str) -> Result<()> {
        let cutoff = Utc::now().timestamp_micros() - self.refresh_ttl.as_micros() as i64;
        let removed = self.redis.zrem_up_to(key, cutoff as f64).await?;
        if removed > 0 {
            debug!(key, removed, "pruned expired refresh tokens");
        }
        Ok(())
    }

    async fn track_refresh(&self, claims: &Claims) -> Result<()> {
        let key = refresh_set_key(&claims.sub);
        self.prune_expired(&key).await?;
        let score = Utc::now().timestamp_micros() as f64;
        self.redis.zadd(&key, &claims.jti, score).await?;
        self.redis.expire(&key, self.refresh_ttl).await?;

        let live = self.redis.zrange_all(&key).await?;
        if live.len() > self.max_refresh_tokens {
            let excess = live.len() - self.max_refresh_tokens;
            for jti in &live[..excess] {
                self.redis.zrem(&key, jti).await?;
                self.blacklist(jti, self.refresh_ttl).await?;
                debug!(user_id = %claims.sub, jti = %jti, "evicted oldest refresh token");
            }
        }
        Ok(())
    }

    async fn blacklist(&self, jti: &str, ttl: Duration) -> Result<()> {
        let ttl = ttl.max(Duration::from_secs(1));
        self.redis.set_raw_ex(&blacklist_key(jti), b"1", ttl).await
    }

    fn remaining(claims: &Claims) -> Duration {
        Duration::from_secs((claims.exp - Utc::now().timestamp()).max(1) as u64)
    }

    /// Decode and check signature, expiry, kind and blacklist.
    pub async fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        if claims.kind != kind {
            return Err(Error::Unauthorized(format!("expected a {:?} token", kind).to_lowercase()));
        }
        if self.redis.exists(&blacklist_key(&claims.jti)).await? {
            return Err(Error::Unauthorized("token has been revoked".to_string()));
        }
        Ok(claims)
    }

    pub async fn verify_access(&self, token: &str) -> Result<Claims> {
        self.verify(token, TokenKind::Access).await
    }

    /// Exchange a refresh token for a new pair. The presented refresh token
    /// is consumed.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.verify(refresh_token, TokenKind::Refresh).await?;
        let key = refresh_set_key(&claims.sub);
        if !self.redis.zrem(&key, &claims.jti).await? {
            return Err(Error::Unauthorized("refresh token is no longer active".to_string()));
        }
        self.blacklist(&claims.jti, Self::remaining(&claims)).await?;
        self.issue_pair(&claims.sub, claims.role).await
    }

    /// Revoke a single token of either kind.
    pub async fn revoke(&self, token: &str) -> Result<Claims> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)?.claims;
        self.blacklist(&claims.jti, Self::remaining(&claims)).await?;
        if claims.kind == TokenKind::Refresh {
            self.redis.zrem(&refresh_set_key(&claims.sub), &claims.jti).await?;
        }
        info!(user_id = %claims.sub, kind = ?claims.kind, "token revoked");
        Ok(claims)
    }

    /// Revoke every live refresh token of `user_id`. Returns how many were revoked.
    pub async fn revoke_all_for_user(&self, user_id: &str) -> Result<usize> {
        let key = refresh_set_key(user_id);
        let live = self.redis.zrange_all(&key).await?;
        for jti in &live {
            self.blacklist(jti, self.refresh_ttl).await?;
        }
        self.redis.delete_raw(&key).await?;
        info!(user_id, revoked = live.len(), "revoked all refresh tokens");
        Ok(live.len())
    }

    pub async fn active_refresh_tokens(&self, user_id: &str) -> Result<usize> {
        let key = refresh_set_key(user_id);
        self.prune_expired(&key).await?;
        self.redis.zcard(&key).await
    }

    #[cfg(test)]
    fn sign_with_exp(&self, user_id: &str, kind: TokenKind, exp: i64) -> String {
        let claims = Claims {
            sub: user_id.to_string(),
            role: Role::Viewer,
            jti: Uuid::new_v4().to_string(),
            kind,
            iat: exp - 10,
            exp,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).unwrap()
    }
}
