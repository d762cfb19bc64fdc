//! Hybrid property search: semantic matches from the vector store merged
//! with filtered rows from the property database, ranked and cached.

pub mod engine;
pub mod params;
pub mod ranking;
pub mod structured;
pub mod vector;

pub use engine::{BackendHealth, HybridSearchEngine, SearchPerformance, SearchResponse, WarmReport};
pub use params::{SearchMode, SearchParams};
pub use ranking::{RankingWeights, ResultSource, SearchHit};
pub use structured::{InMemoryPropertyRepository, PgPropertyRepository, PropertyRepository};
pub use vector::{ChromaClient, InMemoryVectorIndex, VectorBackend, VectorDocument, VectorFilter, VectorMatch};
