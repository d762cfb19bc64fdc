use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::params::{SearchMode, SearchParams};
use super::ranking::{rank, RankingWeights, SearchHit};
use super::structured::PropertyRepository;
use super::vector::{VectorBackend, VectorFilter};
use crate::cache::{CacheManager, CacheStats};
use crate::config::SearchConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub params: SearchParams,
    pub results: Vec<SearchHit>,
    pub total: usize,
    pub vector_candidates: usize,
    pub structured_candidates: usize,
    /// Backends that failed during a hybrid search; such responses are not cached.
    #[serde(default)]
    pub degraded: Vec<String>,
    pub cached: bool,
    pub took_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchPerformance {
    pub total_searches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub by_mode: HashMap<SearchMode, u64>,
    pub avg_latency_ms: f64,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    hits: u64,
    misses: u64,
    failures: u64,
    by_mode: HashMap<SearchMode, u64>,
    latency_ms_sum: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmReport {
    pub warmed: usize,
    pub already_cached: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub vector_backend: String,
    pub vector_ok: bool,
    pub structured_backend: String,
    pub structured_ok: bool,
}

pub struct HybridSearchEngine {
    vector: Arc<dyn VectorBackend>,
    structured: Arc<dyn PropertyRepository>,
    cache: CacheManager,
    config: SearchConfig,
    counters: Mutex<Counters>,
}

impl HybridSearchEngine {
    pub fn new(
        vector: Arc<dyn VectorBackend>,
        structured: Arc<dyn PropertyRepository>,
        cache: CacheManager,
        config: SearchConfig,
    ) -> Self {
        Self {
            vector,
            structured,
            cache,
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.config.weights
    }

    pub fn vector_backend(&self) -> &Arc<dyn VectorBackend> {
        &self.vector
    }

    pub fn structured_backend(&self) -> &Arc<dyn PropertyRepository> {
        &self.structured
    }

    #[instrument(skip(self, params), fields(mode = ?params.mode, query = %params.query))]
    pub async fn search(&self, params: SearchParams) -> Result<SearchResponse> {
        let started = Instant::now();
        let params = params.normalized(self.config.default_limit, self.config.max_limit)?;
        let key = self.cache.key_for(&params)?;

        match self.cache.get::<SearchResponse>(&key).await {
            Ok(Some(mut cached)) => {
                cached.cached = true;
                cached.took_ms = started.elapsed().as_millis() as u64;
                self.record(params.mode, true, started, false);
                debug!(key = %key, "search served from cache");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!("Search cache read failed, continuing uncached: {}", e),
        }

        let outcome = self.execute(&params).await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.record(params.mode, false, started, true);
                return Err(e);
            }
        };
        response.took_ms = started.elapsed().as_millis() as u64;

        if response.degraded.is_empty() {
            if let Err(e) = self.cache.set(&key, &response, Some(self.config.cache_ttl)).await {
                warn!("Failed to cache search results: {}", e);
            }
        }

        self.record(params.mode, false, started, false);
        info!(
            results = response.total,
            took_ms = response.took_ms,
            "search completed"
        );
        Ok(response)
    }

    async fn execute(&self, params: &SearchParams) -> Result<SearchResponse> {
        let limit = params.effective_limit();
        let filters = params.filters();
        let mut degraded = Vec::new();

        let (structured, vector) = match params.mode {
            SearchMode::Vector => (Vec::new(), self.vector_hits(params, limit * 2).await?),
            SearchMode::Structured => (self.structured_hits(params, limit * 2).await?, Vec::new()),
            SearchMode::Hybrid => {
                let (structured, vector) = tokio::join!(
                    self.structured_hits(params, limit * 2),
                    self.vector_hits(params, limit * 2)
                );
                match (structured, vector) {
                    (Ok(s), Ok(v)) => (s, v),
                    (Ok(s), Err(e)) => {
                        warn!("Vector backend failed, serving structured results only: {}", e);
                        degraded.push(self.vector.name().to_string());
                        (s, Vec::new())
                    }
                    (Err(e), Ok(v)) => {
                        warn!("Structured backend failed, serving vector results only: {}", e);
                        degraded.push(self.structured.name().to_string());
                        (Vec::new(), v)
                    }
                    (Err(se), Err(ve)) => {
                        return Err(Error::Unknown(format!(
                            "both search backends failed: structured: {}; vector: {}",
                            se, ve
                        )));
                    }
                }
            }
        };

        let structured_candidates = structured.len();
        let vector_candidates = vector.len();
        let results = rank(structured, vector, &filters, &self.config.weights, limit);

        Ok(SearchResponse {
            params: params.clone(),
            total: results.len(),
            results,
            vector_candidates,
            structured_candidates,
            degraded,
            cached: false,
            took_ms: 0,
        })
    }

    async fn vector_hits(&self, params: &SearchParams, n: usize) -> Result<Vec<SearchHit>> {
        let filter = VectorFilter {
            location: params.location.clone(),
            property_type: params.property_type.clone(),
        };
        let matches = self.vector.query(&params.query, n, &filter).await?;
        Ok(matches
            .into_iter()
            .map(|m| SearchHit::from_vector(m.id, m.content, m.metadata, m.distance))
            .collect())
    }

    async fn structured_hits(&self, params: &SearchParams, n: usize) -> Result<Vec<SearchHit>> {
        let rows = self.structured.search(&params.filters(), n).await?;
        rows.into_iter()
            .map(|p| {
                let metadata = serde_json::to_value(&p)?;
                Ok(SearchHit::from_structured(
                    p.id.clone(),
                    p.to_content(),
                    metadata,
                    &self.config.weights,
                ))
            })
            .collect()
    }

    fn record(&self, mode: SearchMode, cache_hit: bool, started: Instant, failed: bool) {
        let mut counters = self.counters.lock();
        counters.total += 1;
        *counters.by_mode.entry(mode).or_insert(0) += 1;
        if failed {
            counters.failures += 1;
        } else if cache_hit {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        counters.latency_ms_sum += started.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn performance(&self) -> SearchPerformance {
        let counters = self.counters.lock();
        SearchPerformance {
            total_searches: counters.total,
            cache_hits: counters.hits,
            cache_misses: counters.misses,
            failures: counters.failures,
            by_mode: counters.by_mode.clone(),
            avg_latency_ms: if counters.total > 0 {
                counters.latency_ms_sum / counters.total as f64
            } else {
                0.0
            },
            cache: self.cache.stats(),
        }
    }

    pub async fn clear_cache(&self) -> Result<usize> {
        let removed = self.cache.clear().await?;
        info!(removed, "search cache cleared");
        Ok(removed)
    }

    /// Run each parameter set once so later identical searches hit the cache.
    pub async fn warm_cache(&self, queries: Vec<SearchParams>) -> WarmReport {
        let mut report = WarmReport::default();
        for params in queries {
            match self.search(params).await {
                Ok(response) if response.cached => report.already_cached += 1,
                Ok(_) => report.warmed += 1,
                Err(e) => {
                    warn!("Cache warm-up query failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn health(&self) -> BackendHealth {
        let (vector_ok, structured_ok) = tokio::join!(self.vector.health(), self.structured.health());
        BackendHealth {
            vector_backend: self.vector.name().to_string(),
            vector_ok,
            structured_backend: self.structured.name().to_string(),
            structured_ok,
        }
    }
}
