use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed_text(text).await?);
        }
        Ok(results)
    }

    fn dimension(&self) -> usize;
    fn model_name(&self) -> &str;
}

// External Embedding Service implementation
pub struct ExternalEmbeddingService {
    client: reqwest::Client,
    url: String,
    dimension: usize,
    model_name: String,
}

impl ExternalEmbeddingService {
    pub fn new(url: String, dimension: usize, model_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            dimension,
            model_name,
        }
    }
}

#[async_trait]
impl EmbeddingService for ExternalEmbeddingService {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct Request<'a> {
            text: &'a str,
        }
        #[derive(Deserialize)]
        struct Response {
            embedding: Vec<f32>,
        }

        let response = self
            .client
            .post(&self.url)
            .json(&Request { text })
            .send()
            .await?
            .error_for_status()?;
        let response: Response = response.json().await?;
        if response.embedding.len() != self.dimension {
            return Err(Error::VectorStore(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                response.embedding.len()
            )));
        }
        Ok(response.embedding)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// Feature-hashing bag-of-words embedder. Deterministic and offline, so the
/// in-memory vector index works without an embedding server.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let lowered = text.to_lowercase();
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        let mut add = |feature: &str, weight: f32| {
            let digest = md5::compute(feature.as_bytes()).0;
            let mut idx_bytes = [0u8; 8];
            idx_bytes.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(idx_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign * weight;
        };

        for token in &tokens {
            add(token, 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingService for HashingEmbedder {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

// Factory for creating embedding services
pub struct EmbeddingFactory;

impl EmbeddingFactory {
    pub fn create(config: &EmbeddingConfig) -> Arc<dyn EmbeddingService> {
        match &config.provider {
            EmbeddingProvider::External(url) => Arc::new(ExternalEmbeddingService::new(
                url.clone(),
                config.dimension,
                config.model.clone(),
            )),
            EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::new(config.dimension)),
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_normalized() {
        let embedder = HashingEmbedder::new(64);
        let a = embedder.embed("Villa in Palm Jumeirah");
        let b = embedder.embed("villa in palm jumeirah");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(embedder.embed("").iter().all(|v| *v == 0.0));
    }

    #[test]
    fn related_texts_are_closer() {
        let embedder = HashingEmbedder::new(256);
        let query = embedder.embed("apartment in dubai marina");
        let near = embedder.embed("two bedroom apartment in dubai marina with sea view");
        let far = embedder.embed("labour law for domestic workers");
        assert!(cosine_similarity(&query, &near) > cosine_similarity(&query, &far));
    }
}
