use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ok, require_role, ApiResult, AppState};
use crate::auth::{AuthUser, Role};
use crate::models::{ModelRecord, RegisterModel};

const ADMIN: &[Role] = &[Role::Admin];

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub task: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

pub async fn list(
    State(state): State<AppState>,
    _user: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<ModelRecord>> {
    ok(state.rag.models.list(query.task.as_deref()).await?)
}

pub async fn register(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<RegisterModel>,
) -> ApiResult<ModelRecord> {
    require_role(&user, ADMIN)?;
    ok(state.rag.models.register(request).await?)
}

pub async fn get(State(state): State<AppState>, _user: AuthUser, Path(id): Path<String>) -> ApiResult<ModelRecord> {
    ok(state.rag.models.get(&id).await?)
}

pub async fn activate(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<ModelRecord> {
    require_role(&user, ADMIN)?;
    ok(state.rag.models.activate(&id).await?)
}

pub async fn delete(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResult<Deleted> {
    require_role(&user, ADMIN)?;
    state.rag.models.delete(&id).await?;
    ok(Deleted { id, deleted: true })
}
