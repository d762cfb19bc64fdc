use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;

use super::{ok, require_role, ApiResult, AppState, WRITERS};
use crate::auth::AuthUser;
use crate::knowledge::{DocumentIngestReport, KnowledgeStats, PropertyIngestReport};
use crate::property::Property;

#[derive(Debug, Deserialize)]
pub struct DocumentRequest {
    pub content: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Deserialize)]
pub struct PropertiesRequest {
    pub properties: Vec<Property>,
}

pub async fn ingest_document(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<DocumentRequest>,
) -> ApiResult<DocumentIngestReport> {
    require_role(&user, WRITERS)?;
    ok(state
        .rag
        .knowledge
        .ingest_document(&request.content, request.metadata)
        .await?)
}

pub async fn ingest_properties(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<PropertiesRequest>,
) -> ApiResult<PropertyIngestReport> {
    require_role(&user, WRITERS)?;
    ok(state.rag.knowledge.ingest_properties(request.properties).await?)
}

pub async fn stats(State(state): State<AppState>, _user: AuthUser) -> ApiResult<KnowledgeStats> {
    ok(state.rag.knowledge.stats().await?)
}
