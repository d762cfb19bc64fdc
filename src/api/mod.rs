//! HTTP surface: router, shared state, response envelope and the
//! authentication middleware.

pub mod auth;
pub mod batch;
pub mod chat;
pub mod files;
pub mod knowledge;
pub mod models;
pub mod search;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{DefaultBodyLimit, Query, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::auth::{AuthUser, Role};
use crate::error::{Error, Result};
use crate::search::BackendHealth;
use crate::EstateRag;

/// Envelope shared by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Fixed one-minute window per caller.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, (Instant, u32)>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, key: &str) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut entry = self.windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        if entry.1 > self.limit {
            Err(Error::RateLimitExceeded)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub rag: Arc<EstateRag>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(rag: Arc<EstateRag>) -> Self {
        let limiter = RateLimiter::new(rag.config.server.rate_limit_per_minute, Duration::from_secs(60));
        Self {
            rag,
            limiter: Arc::new(limiter),
        }
    }
}

/// Raw access token of the current request, kept for logout.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

pub fn require_role(user: &AuthUser, allowed: &[Role]) -> Result<()> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(Error::Forbidden(format!("role '{}' may not perform this action", user.role)))
    }
}

/// Roles that may add or change content.
pub const WRITERS: &[Role] = &[Role::Admin, Role::Manager, Role::Agent];
pub const MANAGERS: &[Role] = &[Role::Admin, Role::Manager];

const WEBSOCKET_PATH: &str = "/ws/chat";

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let mut parts = value.splitn(2, ' ');
        if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
            if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
    }
    // Browsers cannot set headers on a WebSocket handshake.
    if request.uri().path() != WEBSOCKET_PATH {
        return None;
    }
    Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.access_token)
        .filter(|token| !token.is_empty())
}

async fn authenticate(State(state): State<AppState>, mut request: Request, next: Next) -> Result<Response> {
    let user = if state.rag.config.auth.enabled {
        let token = bearer_token(&request)
            .ok_or_else(|| Error::Unauthorized("missing bearer token".to_string()))?;
        let claims = state.rag.tokens.verify_access(&token).await?;
        request.extensions_mut().insert(BearerToken(token));
        AuthUser::from(claims)
    } else {
        AuthUser::development()
    };
    state.limiter.check(&user.user_id)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub fn create_app(state: AppState) -> Router {
    let config = state.rag.config.clone();

    let public = Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/refresh", post(auth::refresh));

    let protected = Router::new()
        .route("/api/v1/auth/logout", post(auth::logout))
        .route("/api/v1/auth/me", get(auth::me))
        .route("/api/v1/chat", post(chat::chat))
        .route("/api/v1/chat/:session_id/history", get(chat::history))
        .route("/api/v1/chat/:session_id", delete(chat::clear_history))
        .route(WEBSOCKET_PATH, get(chat::websocket))
        .route("/api/v1/search/hybrid", post(search::hybrid_search))
        .route("/api/v1/search/performance", get(search::performance))
        .route("/api/v1/search/cache", delete(search::clear_cache))
        .route("/api/v1/search/cache/warm", post(search::warm_cache))
        .route(
            "/api/v1/files/upload",
            post(files::upload).layer(DefaultBodyLimit::max(config.files.max_file_size + 64 * 1024)),
        )
        .route("/api/v1/knowledge/documents", post(knowledge::ingest_document))
        .route("/api/v1/knowledge/properties", post(knowledge::ingest_properties))
        .route("/api/v1/knowledge/stats", get(knowledge::stats))
        .route("/api/v1/models", get(models::list).post(models::register))
        .route("/api/v1/models/:id", get(models::get).delete(models::delete))
        .route("/api/v1/models/:id/activate", post(models::activate))
        .route("/api/v1/batch/ingest", post(batch::ingest))
        .route("/api/v1/batch", get(batch::list))
        .route("/api/v1/batch/:id", get(batch::status).delete(batch::cancel))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let mut app = public.merge(protected).layer(
        ServiceBuilder::new()
            // Paths only: query strings can carry access tokens.
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }))
            .layer(TimeoutLayer::new(config.server.request_timeout)),
    );
    if config.server.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        );
    }
    app.with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    version: String,
    redis_connected: bool,
    redis_fallback: bool,
    redis_stats: HashMap<String, u64>,
    backends: BackendHealth,
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let redis_connected = state.rag.redis.health_check().await.unwrap_or(false);
    let backends = state.rag.engine.health().await;
    let healthy = redis_connected && backends.vector_ok && backends.structured_ok;

    let health = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        redis_connected,
        redis_fallback: state.rag.redis.is_fallback(),
        redis_stats: state.rag.redis.get_stats().await,
        backends,
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(ApiResponse::success(health)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_blocks_after_limit() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("u1").is_ok());
        assert!(limiter.check("u1").is_ok());
        assert!(matches!(limiter.check("u1"), Err(Error::RateLimitExceeded)));
        assert!(limiter.check("u2").is_ok());

        let unlimited = RateLimiter::new(0, Duration::from_secs(60));
        for _ in 0..1000 {
            assert!(unlimited.check("u1").is_ok());
        }
    }

    fn request(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[test]
    fn query_token_only_accepted_on_websocket_route() {
        assert_eq!(
            bearer_token(&request("/ws/chat?access_token=abc%2Edef.ghi")).as_deref(),
            Some("abc.def.ghi")
        );
        assert_eq!(bearer_token(&request("/api/v1/auth/me?access_token=abc.def.ghi")), None);
        assert_eq!(bearer_token(&request("/ws/chat?access_token=")), None);
        assert_eq!(bearer_token(&request("/ws/chat")), None);
    }

    #[test]
    fn role_gate() {
        let mut user = AuthUser::development();
        assert!(require_role(&user, MANAGERS).is_ok());
        user.role = Role::Viewer;
        assert!(matches!(require_role(&user, WRITERS), Err(Error::Forbidden(_))));
    }
}
