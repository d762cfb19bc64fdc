use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ok, require_role, ApiResult, AppState, MANAGERS};
use crate::auth::{AuthUser, DataType};
use crate::error::Error;
use crate::search::{SearchParams, SearchPerformance, SearchResponse, WarmReport};

/// Upper bound on queries accepted by one warm-up request.
const MAX_WARM_QUERIES: usize = 100;

#[derive(Debug, Deserialize)]
pub struct WarmRequest {
    pub queries: Vec<SearchParams>,
}

#[derive(Debug, Serialize)]
pub struct ClearedCache {
    pub cleared: usize,
}

pub async fn hybrid_search(
    State(state): State<AppState>,
    user: AuthUser,
    Json(params): Json<SearchParams>,
) -> ApiResult<SearchResponse> {
    let rbac = &state.rag.rbac;
    rbac.require(user.role, DataType::Property)?;

    let mut response = state.rag.engine.search(params).await?;
    for hit in &mut response.results {
        let metadata = std::mem::take(&mut hit.metadata);
        hit.metadata = rbac.filter_fields(user.role, DataType::Property, metadata)?;
    }
    ok(response)
}

pub async fn performance(State(state): State<AppState>, _user: AuthUser) -> ApiResult<SearchPerformance> {
    ok(state.rag.engine.performance())
}

pub async fn clear_cache(State(state): State<AppState>, user: AuthUser) -> ApiResult<ClearedCache> {
    require_role(&user, MANAGERS)?;
    let cleared = state.rag.engine.clear_cache().await?;
    info!(user_id = %user.user_id, cleared, "search cache cleared");
    ok(ClearedCache { cleared })
}

pub async fn warm_cache(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<WarmRequest>,
) -> ApiResult<WarmReport> {
    require_role(&user, MANAGERS)?;
    if request.queries.len() > MAX_WARM_QUERIES {
        return Err(Error::InvalidInput(format!(
            "at most {} queries can be warmed at once",
            MAX_WARM_QUERIES
        )));
    }
    ok(state.rag.engine.warm_cache(request.queries).await)
}
