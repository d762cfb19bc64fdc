//! Merge, deduplicate and re-rank results from the vector and structured
//! backends.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::property::PropertyFilters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Vector,
    Structured,
}

/// Scoring constants. The defaults reproduce the production heuristic; they
/// are exposed so they can be tuned from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingWeights {
    /// Relevance assigned to every structured (SQL) result.
    pub structured_relevance: f64,
    pub structured_boost: f64,
    pub vector_boost: f64,
    /// Applied when the location filter appears in the result content.
    pub location_boost: f64,
    /// Applied when the property-type filter appears in the result content.
    pub property_type_boost: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            structured_relevance: 0.9,
            structured_boost: 1.2,
            vector_boost: 1.1,
            location_boost: 1.15,
            property_type_boost: 1.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub source: ResultSource,
    pub relevance: f64,
    pub score: f64,
}

impl SearchHit {
    pub fn from_vector(
        id: String,
        content: String,
        metadata: serde_json::Value,
        distance: f64,
    ) -> Self {
        let relevance = 1.0 - distance;
        Self {
            id,
            content,
            metadata,
            source: ResultSource::Vector,
            relevance,
            score: relevance,
        }
    }

    pub fn from_structured(
        id: String,
        content: String,
        metadata: serde_json::Value,
        weights: &RankingWeights,
    ) -> Self {
        Self {
            id,
            content,
            metadata,
            source: ResultSource::Structured,
            relevance: weights.structured_relevance,
            score: weights.structured_relevance,
        }
    }
}

pub fn content_hash(content: &str) -> String {
    format!("{:x}", md5::compute(content.as_bytes()))
}

/// Drop exact content duplicates, keeping the first occurrence.
pub fn deduplicate(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::with_capacity(hits.len());
    hits.into_iter()
        .filter(|hit| seen.insert(content_hash(&hit.content)))
        .collect()
}

fn mentions(content_lower: &str, needle: Option<&str>) -> bool {
    match needle.map(str::trim) {
        Some(n) if !n.is_empty() => content_lower.contains(&n.to_lowercase()),
        _ => false,
    }
}

pub fn score(hit: &SearchHit, filters: &PropertyFilters, weights: &RankingWeights) -> f64 {
    let mut score = hit.relevance
        * match hit.source {
            ResultSource::Structured => weights.structured_boost,
            ResultSource::Vector => weights.vector_boost,
        };

    let content = hit.content.to_lowercase();
    if mentions(&content, filters.location.as_deref()) {
        score *= weights.location_boost;
    }
    if mentions(&content, filters.property_type.as_deref()) {
        score *= weights.property_type_boost;
    }
    score
}

/// Structured hits are merged ahead of vector hits so that, for identical
/// content, the structured copy survives deduplication.
pub fn rank(
    structured: Vec<SearchHit>,
    vector: Vec<SearchHit>,
    filters: &PropertyFilters,
    weights: &RankingWeights,
    limit: usize,
) -> Vec<SearchHit> {
    let mut merged = structured;
    merged.extend(vector);

    let mut ranked: Vec<SearchHit> = deduplicate(merged)
        .into_iter()
        .map(|mut hit| {
            hit.score = score(&hit, filters, weights);
            hit
        })
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vector_hit(id: &str, content: &str, distance: f64) -> SearchHit {
        SearchHit::from_vector(id.into(), content.into(), json!({}), distance)
    }

    fn structured_hit(id: &str, content: &str) -> SearchHit {
        SearchHit::from_structured(id.into(), content.into(), json!({}), &RankingWeights::default())
    }

    #[test]
    fn base_scores_follow_source_multipliers() {
        let weights = RankingWeights::default();
        let filters = PropertyFilters::default();
        let v = vector_hit("v", "anything", 0.25);
        assert!((v.relevance - 0.75).abs() < 1e-12);
        assert!((score(&v, &filters, &weights) - 0.75 * 1.1).abs() < 1e-12);

        let s = structured_hit("s", "anything");
        assert!((score(&s, &filters, &weights) - 0.9 * 1.2).abs() < 1e-12);
    }

    #[test]
    fn filter_mentions_boost_case_insensitively() {
        let weights = RankingWeights::default();
        let filters = PropertyFilters {
            location: Some("Dubai Marina".into()),
            property_type: Some("apartment".into()),
            ..Default::default()
        };
        let hit = vector_hit("v", "Apartment in DUBAI MARINA", 0.0);
        let expected = 1.0 * 1.1 * 1.15 * 1.1;
        assert!((score(&hit, &filters, &weights) - expected).abs() < 1e-12);

        let empty = PropertyFilters {
            location: Some("   ".into()),
            ..Default::default()
        };
        assert!((score(&hit, &empty, &weights) - 1.1).abs() < 1e-12);
    }

    #[test]
    fn dedup_keeps_structured_copy_and_exact_matches_only() {
        let weights = RankingWeights::default();
        let ranked = rank(
            vec![structured_hit("s1", "Villa in Arabian Ranches")],
            vec![
                vector_hit("v1", "Villa in Arabian Ranches", 0.0),
                vector_hit("v2", "Villa in Arabian Ranches.", 0.1),
            ],
            &PropertyFilters::default(),
            &weights,
            10,
        );
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().any(|h| h.id == "s1"));
        assert!(!ranked.iter().any(|h| h.id == "v1"));
    }

    #[test]
    fn rank_sorts_descending_and_truncates() {
        let ranked = rank(
            vec![],
            vec![
                vector_hit("far", "a", 0.9),
                vector_hit("near", "b", 0.1),
                vector_hit("mid", "c", 0.5),
            ],
            &PropertyFilters::default(),
            &RankingWeights::default(),
            2,
        );
        let ids: Vec<_> = ranked.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);
    }
}
