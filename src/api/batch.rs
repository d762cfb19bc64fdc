use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ok, require_role, ApiResult, AppState, WRITERS};
use crate::auth::AuthUser;
use crate::batch::BatchJob;
use crate::error::Error;
use crate::property::Property;

/// How long the post-job cache refresh waits for a job to finish.
const JOB_WATCH_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct BatchIngestRequest {
    pub properties: Vec<Property>,
}

#[derive(Debug, Serialize)]
pub struct Submitted {
    pub job_id: String,
    pub total: usize,
}

pub async fn ingest(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<BatchIngestRequest>,
) -> ApiResult<Submitted> {
    require_role(&user, WRITERS)?;
    let total = request.properties.len();

    let knowledge = state.rag.knowledge.clone();
    let job_id = state.rag.batch.submit("property_ingest", request.properties, move |property: Property| {
        let knowledge = knowledge.clone();
        async move { knowledge.ingest_property(&property).await }
    })?;

    let batch = state.rag.batch.clone();
    let knowledge = state.rag.knowledge.clone();
    let watched = job_id.clone();
    tokio::spawn(async move {
        match batch.wait(&watched, JOB_WATCH_TIMEOUT).await {
            Ok(job) if job.status.is_terminal() => knowledge.refresh_search_cache().await,
            Ok(_) => warn!(job_id = %watched, "batch job still running, search cache not refreshed"),
            Err(e) => warn!(job_id = %watched, "lost track of batch job: {}", e),
        }
    });

    info!(user_id = %user.user_id, job_id = %job_id, total, "batch ingest submitted");
    ok(Submitted { job_id, total })
}

pub async fn list(State(state): State<AppState>, _user: AuthUser) -> ApiResult<Vec<BatchJob>> {
    ok(state.rag.batch.list())
}

pub async fn status(State(state): State<AppState>, _user: AuthUser, Path(id): Path<String>) -> ApiResult<BatchJob> {
    let job = state
        .rag
        .batch
        .status(&id)
        .ok_or_else(|| Error::NotFound(format!("batch job {}", id)))?;
    ok(job)
}

pub async fn cancel(State(state): State<AppState>, user: AuthUser, Path(id): Path<String>) -> ApiResult<BatchJob> {
    require_role(&user, WRITERS)?;
    ok(state.rag.batch.cancel(&id)?)
}
