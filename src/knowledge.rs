//! Knowledge-base ingestion: free-text documents are chunked into the
//! vector backend, listings go to both backends.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::KnowledgeConfig;
use crate::error::{Error, Result};
use crate::property::Property;
use crate::search::{HybridSearchEngine, VectorDocument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub text: String,
    pub start_index: usize,
    pub end_index: usize,
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn next_boundary(text: &str, index: usize) -> usize {
    text[index..]
        .chars()
        .next()
        .map_or(text.len(), |c| index + c.len_utf8())
}

/// Byte ranges of overlapping windows over `text`. Ends never split a
/// character, and a window is cut at the last whitespace in its second
/// half when there is one.
pub fn chunk_ranges(text: &str, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let len = text.len();
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < len {
        let mut end = floor_boundary(text, (start + size).min(len));
        if end <= start {
            end = next_boundary(text, start);
        }
        if end < len {
            if let Some(ws) = text[start..end].rfind(char::is_whitespace) {
                if ws > 0 && ws >= (end - start) / 2 {
                    end = start + ws;
                }
            }
        }
        ranges.push((start, end));
        if end >= len {
            break;
        }
        let next = floor_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }
    ranges
}

pub fn chunk_document(document_id: &str, text: &str, config: &KnowledgeConfig) -> Vec<DocumentChunk> {
    chunk_ranges(text, config.chunk_size, config.chunk_overlap)
        .into_iter()
        .filter(|(s, e)| !text[*s..*e].trim().is_empty())
        .enumerate()
        .map(|(i, (start, end))| DocumentChunk {
            id: format!("{}-chunk-{}", document_id, i),
            document_id: document_id.to_string(),
            text: text[start..end].trim().to_string(),
            start_index: start,
            end_index: end,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIngestReport {
    pub document_id: String,
    pub chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyIngestReport {
    pub ingested: usize,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub vector_backend: String,
    pub vector_documents: usize,
    pub structured_backend: String,
    pub properties: usize,
    pub documents_ingested: u64,
    pub chunks_ingested: u64,
    pub properties_ingested: u64,
}

/// Reject listings that would poison search results.
pub fn validate_property(property: &Property) -> Result<()> {
    if property.id.trim().is_empty() {
        return Err(Error::InvalidInput("property id is required".to_string()));
    }
    if property.location.trim().is_empty() || property.property_type.trim().is_empty() {
        return Err(Error::InvalidInput(format!(
            "property {} needs a location and a type",
            property.id
        )));
    }
    if !property.price.is_finite() || property.price <= 0.0 {
        return Err(Error::InvalidInput(format!("property {} has an invalid price", property.id)));
    }
    if property.bedrooms < 0 || property.bathrooms < 0 || !property.area_sqft.is_finite() || property.area_sqft < 0.0 {
        return Err(Error::InvalidInput(format!(
            "property {} has negative dimensions",
            property.id
        )));
    }
    Ok(())
}

fn property_document(property: &Property) -> VectorDocument {
    VectorDocument {
        id: property.id.clone(),
        content: property.to_content(),
        metadata: property.vector_metadata(),
    }
}

pub struct KnowledgeBase {
    engine: Arc<HybridSearchEngine>,
    config: KnowledgeConfig,
    documents: AtomicU64,
    chunks: AtomicU64,
    properties: AtomicU64,
}

impl KnowledgeBase {
    pub fn new(engine: Arc<HybridSearchEngine>, config: KnowledgeConfig) -> Self {
        Self {
            engine,
            config,
            documents: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            properties: AtomicU64::new(0),
        }
    }

    /// New content changes what a cached search would return.
    async fn invalidate_search_cache(&self) {
        if let Err(e) = self.engine.clear_cache().await {
            warn!("Failed to clear search cache after ingestion: {}", e);
        }
    }

    #[instrument(skip(self, content, metadata), fields(bytes = content.len()))]
    pub async fn ingest_document(&self, content: &str, metadata: Value) -> Result<DocumentIngestReport> {
        if content.trim().is_empty() {
            return Err(Error::InvalidInput("document content is empty".to_string()));
        }
        let metadata = match metadata {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            _ => return Err(Error::InvalidInput("metadata must be a JSON object".to_string())),
        };

        let document_id = Uuid::new_v4().to_string();
        let chunks = chunk_document(&document_id, content, &self.config);
        let documents: Vec<VectorDocument> = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut meta = metadata.clone();
                if let Value::Object(map) = &mut meta {
                    map.insert("source".into(), json!("document"));
                    map.insert("document_id".into(), json!(document_id));
                    map.insert("chunk_index".into(), json!(i));
                }
                VectorDocument {
                    id: chunk.id.clone(),
                    content: chunk.text.clone(),
                    metadata: meta,
                }
            })
            .collect();

        self.engine.vector_backend().upsert(&documents).await?;
        self.documents.fetch_add(1, Ordering::Relaxed);
        self.chunks.fetch_add(documents.len() as u64, Ordering::Relaxed);
        self.invalidate_search_cache().await;

        info!(document_id = %document_id, chunks = documents.len(), "document ingested");
        Ok(DocumentIngestReport {
            document_id,
            chunks: documents.len(),
        })
    }

    /// Single listing, used by batch jobs where each item is retried on its own.
    pub async fn ingest_property(&self, property: &Property) -> Result<()> {
        validate_property(property)?;
        self.engine.structured_backend().upsert(property).await?;
        self.engine
            .vector_backend()
            .upsert(&[property_document(property)])
            .await?;
        self.properties.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    #[instrument(skip(self, properties), fields(count = properties.len()))]
    pub async fn ingest_properties(&self, properties: Vec<Property>) -> Result<PropertyIngestReport> {
        let mut report = PropertyIngestReport::default();
        let mut accepted = Vec::with_capacity(properties.len());
        for property in properties {
            match validate_property(&property) {
                Ok(()) => accepted.push(property),
                Err(e) => report.rejected.push(e.to_string()),
            }
        }

        let structured = self.engine.structured_backend();
        let mut stored = 0;
        let mut outcome = Ok(());
        for property in &accepted {
            if let Err(e) = structured.upsert(property).await {
                outcome = Err(e);
                break;
            }
            stored += 1;
        }
        if outcome.is_ok() {
            let documents: Vec<VectorDocument> = accepted.iter().map(property_document).collect();
            outcome = self.engine.vector_backend().upsert(&documents).await;
        }
        // Rows already committed change search results even when a later step failed.
        if stored > 0 {
            self.invalidate_search_cache().await;
        }
        if let Err(e) = outcome {
            warn!(stored, accepted = accepted.len(), "property ingestion failed part way: {}", e);
            return Err(e);
        }

        report.ingested = accepted.len();
        self.properties.fetch_add(accepted.len() as u64, Ordering::Relaxed);
        info!(ingested = report.ingested, rejected = report.rejected.len(), "properties ingested");
        Ok(report)
    }

    pub async fn stats(&self) -> Result<KnowledgeStats> {
        let vector = self.engine.vector_backend();
        let structured = self.engine.structured_backend();
        let (vector_documents, properties) = tokio::try_join!(vector.count(), structured.count())?;
        Ok(KnowledgeStats {
            vector_backend: vector.name().to_string(),
            vector_documents,
            structured_backend: structured.name().to_string(),
            properties,
            documents_ingested: self.documents.load(Ordering::Relaxed),
            chunks_ingested: self.chunks.load(Ordering::Relaxed),
            properties_ingested: self.properties.load(Ordering::Relaxed),
        })
    }

    /// Drop cached search results after out-of-band changes such as batch jobs.
    pub async fn refresh_search_cache(&self) {
        self.invalidate_search_cache().await;
    }
}
