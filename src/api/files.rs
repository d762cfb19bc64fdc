use axum::extract::{Multipart, State};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use super::{ok, require_role, ApiResult, AppState, WRITERS};
use crate::auth::AuthUser;
use crate::error::Error;
use crate::files::StoredFile;
use crate::knowledge::DocumentIngestReport;

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file: StoredFile,
    pub ingested: Option<DocumentIngestReport>,
}

/// Multipart fields: `file` (required) and `ingest` (`true` to index a text upload).
pub async fn upload(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<UploadResponse> {
    require_role(&user, WRITERS)?;

    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut ingest = false;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| Error::InvalidInput("file field has no filename".to_string()))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("failed to read upload: {}", e)))?;
                upload = Some((filename, bytes.to_vec()));
            }
            Some("ingest") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("failed to read ingest flag: {}", e)))?;
                ingest = matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
            }
            _ => {}
        }
    }

    let (filename, bytes) = upload.ok_or_else(|| Error::InvalidInput("missing 'file' field".to_string()))?;
    let validated = state.rag.file_validator.validate(&filename, &bytes)?;
    if ingest && !validated.is_text() {
        return Err(Error::InvalidInput(format!(
            "only text uploads can be ingested, got .{}",
            validated.extension
        )));
    }
    let stored = state.rag.file_store.store(&validated, &bytes).await?;

    let ingested = if ingest {
        // Validation already guaranteed UTF-8 for text types.
        let content = String::from_utf8_lossy(&bytes);
        let metadata = json!({
            "filename": stored.original_name,
            "file_id": stored.id,
            "uploaded_by": user.user_id,
        });
        Some(state.rag.knowledge.ingest_document(&content, metadata).await?)
    } else {
        None
    };

    info!(user_id = %user.user_id, file = %stored.stored_name, ingested = ingested.is_some(), "file uploaded");
    ok(UploadResponse { file: stored, ingested })
}
