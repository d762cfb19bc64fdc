//! Vector backends: the ChromaDB REST client used in production and a flat
//! in-memory cosine index for development and tests.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use crate::config::VectorStoreConfig;
use crate::embedding::{cosine_similarity, EmbeddingService};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub content: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub id: String,
    pub content: String,
    pub metadata: Value,
    pub distance: f64,
}

/// Exact-equality metadata constraints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorFilter {
    pub location: Option<String>,
    pub property_type: Option<String>,
}

impl VectorFilter {
    fn clauses(&self) -> Vec<(&'static str, &str)> {
        let mut clauses = Vec::new();
        if let Some(location) = self.location.as_deref() {
            clauses.push(("location", location));
        }
        if let Some(kind) = self.property_type.as_deref() {
            clauses.push(("property_type", kind));
        }
        clauses
    }

    pub fn matches(&self, metadata: &Value) -> bool {
        self.clauses()
            .into_iter()
            .all(|(field, expected)| metadata.get(field).and_then(Value::as_str) == Some(expected))
    }

    /// Chroma `where` document, or `None` when unconstrained.
    pub fn to_chroma_where(&self) -> Option<Value> {
        let clauses: Vec<Value> = self
            .clauses()
            .into_iter()
            .map(|(field, expected)| json!({ field: { "$eq": expected } }))
            .collect();
        match clauses.len() {
            0 => None,
            1 => clauses.into_iter().next(),
            _ => Some(json!({ "$and": clauses })),
        }
    }
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn query(&self, text: &str, n_results: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>>;
    async fn upsert(&self, documents: &[VectorDocument]) -> Result<()>;
    async fn delete(&self, ids: &[String]) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    async fn health(&self) -> bool;
    fn name(&self) -> &'static str;
}

pub struct InMemoryVectorIndex {
    embedder: Arc<dyn EmbeddingService>,
    entries: DashMap<String, (VectorDocument, Vec<f32>)>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn EmbeddingService>) -> Self {
        Self {
            embedder,
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl VectorBackend for InMemoryVectorIndex {
    async fn query(&self, text: &str, n_results: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>> {
        let query = self.embedder.embed_text(text).await?;
        let mut matches: Vec<VectorMatch> = self
            .entries
            .iter()
            .filter(|entry| filter.matches(&entry.value().0.metadata))
            .map(|entry| {
                let (doc, embedding) = entry.value();
                VectorMatch {
                    id: doc.id.clone(),
                    content: doc.content.clone(),
                    metadata: doc.metadata.clone(),
                    distance: 1.0 - cosine_similarity(&query, embedding) as f64,
                }
            })
            .collect();
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(n_results);
        Ok(matches)
    }

    async fn upsert(&self, documents: &[VectorDocument]) -> Result<()> {
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        for (doc, embedding) in documents.iter().zip(embeddings) {
            self.entries.insert(doc.id.clone(), (doc.clone(), embedding));
        }
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.entries.remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.len())
    }

    async fn health(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Chroma only accepts scalar metadata values; nested values are stored as
/// their JSON text.
pub fn flatten_metadata(metadata: &Value) -> Value {
    let mut flat = serde_json::Map::new();
    if let Value::Object(map) = metadata {
        for (key, value) in map {
            match value {
                Value::Null => {}
                Value::String(_) | Value::Number(_) | Value::Bool(_) => {
                    flat.insert(key.clone(), value.clone());
                }
                other => {
                    flat.insert(key.clone(), Value::String(other.to_string()));
                }
            }
        }
    }
    Value::Object(flat)
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Value>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<f64>>>,
}

impl QueryResponse {
    fn into_matches(self) -> Vec<VectorMatch> {
        let ids = self.ids.into_iter().next().unwrap_or_default();
        let documents = self.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
        let metadatas = self.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
        let distances = self.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

        ids.into_iter()
            .enumerate()
            .map(|(i, id)| VectorMatch {
                id,
                content: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_else(|| json!({})),
                distance: distances.get(i).copied().unwrap_or(1.0),
            })
            .collect()
    }
}

/// Relevance is `1 - distance`, which needs cosine space; Chroma defaults to L2.
fn collection_request(name: &str) -> Value {
    json!({
        "name": name,
        "get_or_create": true,
        "metadata": { "hnsw:space": "cosine" },
    })
}

pub struct ChromaClient {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    collection_id: OnceCell<String>,
    embedder: Arc<dyn EmbeddingService>,
}

impl ChromaClient {
    pub fn new(
        base_url: impl Into<String>,
        config: &VectorStoreConfig,
        embedder: Arc<dyn EmbeddingService>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            collection_id: OnceCell::new(),
            embedder,
        })
    }

    async fn collection_id(&self) -> Result<&str> {
        let id = self
            .collection_id
            .get_or_try_init(|| async {
                let url = format!("{}/api/v1/collections", self.base_url);
                let body = collection_request(&self.collection);
                let response: CollectionResponse = self.post_json(&url, &body, "create collection").await?;
                debug!(collection = %self.collection, id = %response.id, "resolved chroma collection");
                Ok::<_, Error>(response.id)
            })
            .await?;
        Ok(id.as_str())
    }

    async fn post_json<T: serde::de::DeserializeOwned>(&self, url: &str, body: &Value, op: &str) -> Result<T> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::VectorStore(format!("Chroma {} returned {}: {}", op, status, text)));
        }
        response
            .json()
            .await
            .map_err(|e| Error::VectorStore(format!("Chroma {} response: {}", op, e)))
    }

    async fn post_unit(&self, url: &str, body: &Value, op: &str) -> Result<()> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::VectorStore(format!("Chroma {} returned {}: {}", op, status, text)));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorBackend for ChromaClient {
    #[instrument(skip(self, filter), fields(collection = %self.collection))]
    async fn query(&self, text: &str, n_results: usize, filter: &VectorFilter) -> Result<Vec<VectorMatch>> {
        let embedding = self.embedder.embed_text(text).await?;
        let id = self.collection_id().await?;
        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": n_results.max(1),
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(where_clause) = filter.to_chroma_where() {
            body["where"] = where_clause;
        }
        let url = format!("{}/api/v1/collections/{}/query", self.base_url, id);
        let response: QueryResponse = self.post_json(&url, &body, "query").await?;
        Ok(response.into_matches())
    }

    async fn upsert(&self, documents: &[VectorDocument]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        let id = self.collection_id().await?;
        let body = json!({
            "ids": documents.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            "embeddings": embeddings,
            "documents": texts,
            "metadatas": documents.iter().map(|d| flatten_metadata(&d.metadata)).collect::<Vec<_>>(),
        });
        let url = format!("{}/api/v1/collections/{}/upsert", self.base_url, id);
        self.post_unit(&url, &body, "upsert").await
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/delete", self.base_url, id);
        self.post_unit(&url, &json!({ "ids": ids }), "delete").await
    }

    async fn count(&self) -> Result<usize> {
        let id = self.collection_id().await?;
        let url = format!("{}/api/v1/collections/{}/count", self.base_url, id);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json::<usize>().await?)
    }

    async fn health(&self) -> bool {
        let url = format!("{}/api/v1/heartbeat", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Chroma heartbeat failed: {}", e);
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "chroma"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn doc(id: &str, content: &str, location: &str) -> VectorDocument {
        VectorDocument {
            id: id.into(),
            content: content.into(),
            metadata: json!({ "location": location, "property_type": "Villa" }),
        }
    }

    #[tokio::test]
    async fn in_memory_query_ranks_and_filters() {
        let index = InMemoryVectorIndex::new(Arc::new(HashingEmbedder::new(256)));
        index
            .upsert(&[
                doc("a", "villa with private pool in arabian ranches", "Arabian Ranches"),
                doc("b", "villa on the palm with beach access", "Palm Jumeirah"),
                doc("c", "service charges explained for owners", "Downtown Dubai"),
            ])
            .await
            .unwrap();
        assert_eq!(index.count().await.unwrap(), 3);

        let hits = index
            .query("villa pool arabian ranches", 2, &VectorFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance <= hits[1].distance);

        let filtered = index
            .query(
                "villa",
                10,
                &VectorFilter {
                    location: Some("Palm Jumeirah".into()),
                    property_type: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "b");

        index.delete(&["a".to_string()]).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 2);
    }

    #[test]
    fn chroma_where_shapes() {
        assert_eq!(VectorFilter::default().to_chroma_where(), None);
        let one = VectorFilter {
            location: Some("JLT".into()),
            property_type: None,
        };
        assert_eq!(one.to_chroma_where(), Some(json!({"location": {"$eq": "JLT"}})));
        let both = VectorFilter {
            location: Some("JLT".into()),
            property_type: Some("Apartment".into()),
        };
        assert_eq!(
            both.to_chroma_where(),
            Some(json!({"$and": [
                {"location": {"$eq": "JLT"}},
                {"property_type": {"$eq": "Apartment"}}
            ]}))
        );
    }

    #[test]
    fn collections_use_cosine_space() {
        let body = collection_request("dubai_properties");
        assert_eq!(body["name"], "dubai_properties");
        assert_eq!(body["get_or_create"], true);
        assert_eq!(body["metadata"]["hnsw:space"], "cosine");
    }

    #[test]
    fn query_response_parses_first_batch() {
        let raw = json!({
            "ids": [["x", "y"]],
            "documents": [["doc x", null]],
            "metadatas": [[{"location": "JVC"}, null]],
            "distances": [[0.2, 0.4]]
        });
        let parsed: QueryResponse = serde_json::from_value(raw).unwrap();
        let matches = parsed.into_matches();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].content, "doc x");
        assert_eq!(matches[1].content, "");
        assert_eq!(matches[1].metadata, json!({}));
        assert!((matches[1].distance - 0.4).abs() < 1e-12);
    }

    #[test]
    fn metadata_flattening_stringifies_nested() {
        let flat = flatten_metadata(&json!({"a": 1, "b": [1, 2], "c": null, "d": "x"}));
        assert_eq!(flat, json!({"a": 1, "b": "[1,2]", "d": "x"}));
    }
}
