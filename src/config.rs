use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::search::RankingWeights;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub files: FileConfig,
    #[serde(default)]
    pub knowledge: KnowledgeConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
    pub connection_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Serve from an in-process store when Redis cannot be reached at startup.
    /// State is then per-process, which is only acceptable for a single worker.
    #[serde(default = "default_enable_fallback")]
    pub enable_fallback: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pool_size: env_or("REDIS_POOL_SIZE", 10),
            connection_timeout: Duration::from_secs(env_or("REDIS_CONNECTION_TIMEOUT", 5)),
            max_retries: env_or("REDIS_MAX_RETRIES", 3),
            retry_delay: Duration::from_millis(env_or("REDIS_RETRY_DELAY_MS", 100)),
            enable_fallback: env_flag("REDIS_ENABLE_FALLBACK", true),
        }
    }
}

fn default_enable_fallback() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. When unset the structured backend is in-memory.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: std::env::var("DATABASE_URL").ok(),
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
            acquire_timeout: Duration::from_secs(env_or("DATABASE_ACQUIRE_TIMEOUT", 5)),
            run_migrations: env_flag("DATABASE_RUN_MIGRATIONS", true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    /// ChromaDB base URL. When unset the vector backend is in-memory.
    pub chroma_url: Option<String>,
    pub collection: String,
    pub request_timeout: Duration,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            chroma_url: std::env::var("CHROMA_URL").ok(),
            collection: std::env::var("CHROMA_COLLECTION")
                .unwrap_or_else(|_| "dubai_real_estate".to_string()),
            request_timeout: Duration::from_secs(env_or("CHROMA_TIMEOUT", 30)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EmbeddingProvider {
    /// Deterministic feature hashing, no network.
    Hashing,
    /// HTTP service taking `{"text": ...}` and returning `{"embedding": [...]}`.
    External(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimension: usize,
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let provider = match std::env::var("EMBEDDING_URL") {
            Ok(url) => EmbeddingProvider::External(url),
            Err(_) => EmbeddingProvider::Hashing,
        };
        Self {
            provider,
            dimension: env_or("EMBEDDING_DIMENSION", 384),
            model: std::env::var("EMBEDDING_MODEL")
                .unwrap_or_else(|_| "all-MiniLM-L6-v2".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            api_key: std::env::var("LLM_API_KEY").ok(),
            model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            temperature: env_or("LLM_TEMPERATURE", 0.3),
            max_tokens: env_or("LLM_MAX_TOKENS", 800),
            request_timeout: Duration::from_secs(env_or("LLM_TIMEOUT", 60)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub cache_ttl: Duration,
    pub default_limit: usize,
    pub max_limit: usize,
    #[serde(default)]
    pub weights: RankingWeights,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(env_or("SEARCH_CACHE_TTL", 3600)),
            default_limit: 10,
            max_limit: 100,
            weights: RankingWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub username: String,
    /// Argon2id PHC string, see `estate-rag-cli config hash-password`.
    pub password_hash: String,
    pub role: crate::auth::Role,
}

/// Placeholder secret; refused whenever auth is enabled.
pub const DEFAULT_JWT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub max_refresh_tokens_per_user: usize,
    #[serde(default)]
    pub users: Vec<UserAccount>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: env_flag("AUTH_ENABLED", false),
            jwt_secret: std::env::var("JWT_SECRET")
                .unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_string()),
            access_ttl: Duration::from_secs(env_or("ACCESS_TOKEN_TTL", 30 * 60)),
            refresh_ttl: Duration::from_secs(env_or("REFRESH_TOKEN_TTL", 7 * 86400)),
            max_refresh_tokens_per_user: env_or("MAX_REFRESH_TOKENS_PER_USER", 5),
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub upload_dir: PathBuf,
    pub max_file_size: usize,
    pub allowed_extensions: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("uploads")),
            max_file_size: env_or("MAX_UPLOAD_BYTES", 20 * 1024 * 1024),
            allowed_extensions: ["pdf", "docx", "xlsx", "csv", "txt", "md", "json"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Chunk length in bytes.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            chunk_size: env_or("CHUNK_SIZE", 1000),
            chunk_overlap: env_or("CHUNK_OVERLAP", 200),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_workers: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_errors_recorded: usize,
    /// Finished jobs kept for status queries, oldest dropped first.
    #[serde(default = "default_max_finished_jobs")]
    pub max_finished_jobs: usize,
    #[serde(default = "default_finished_job_retention")]
    pub finished_job_retention: Duration,
}

fn default_max_finished_jobs() -> usize {
    env_or("BATCH_MAX_FINISHED_JOBS", 200)
}

fn default_finished_job_retention() -> Duration {
    Duration::from_secs(env_or("BATCH_JOB_RETENTION_SECS", 24 * 3600))
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_workers: env_or("BATCH_MAX_WORKERS", 4),
            chunk_size: env_or("BATCH_CHUNK_SIZE", 50),
            max_retries: env_or("BATCH_MAX_RETRIES", 3),
            retry_base_delay: Duration::from_millis(env_or("BATCH_RETRY_DELAY_MS", 200)),
            max_errors_recorded: 100,
            max_finished_jobs: default_max_finished_jobs(),
            finished_job_retention: default_finished_job_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    pub history_turns: usize,
    pub history_ttl: Duration,
    pub context_results: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            history_turns: 20,
            history_ttl: Duration::from_secs(86400),
            context_results: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout: Duration,
    pub enable_cors: bool,
    /// Requests per user per minute on `/api/v1`. Zero disables the limit.
    #[serde(default)]
    pub rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_or("PORT", 8000),
            request_timeout: Duration::from_secs(60),
            enable_cors: true,
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", 120),
        }
    }
}

impl Config {
    pub fn from_file(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::error::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::Error;

        if self.embedding.dimension == 0 {
            return Err(Error::Config("Embedding dimension must be > 0".to_string()));
        }
        if self.search.default_limit == 0 || self.search.default_limit > self.search.max_limit {
            return Err(Error::Config(
                "Search default_limit must be in 1..=max_limit".to_string(),
            ));
        }
        if self.knowledge.chunk_size == 0 || self.knowledge.chunk_overlap >= self.knowledge.chunk_size {
            return Err(Error::Config(
                "Chunk overlap must be smaller than a non-zero chunk size".to_string(),
            ));
        }
        if self.batch.max_workers == 0 || self.batch.chunk_size == 0 {
            return Err(Error::Config(
                "Batch max_workers and chunk_size must be > 0".to_string(),
            ));
        }
        if self.auth.enabled && self.auth.jwt_secret.len() < 16 {
            return Err(Error::Config(
                "JWT secret must be at least 16 bytes when auth is enabled".to_string(),
            ));
        }
        if self.auth.enabled && self.auth.jwt_secret == DEFAULT_JWT_SECRET {
            return Err(Error::Config(
                "JWT_SECRET must be set to a non-default value when auth is enabled".to_string(),
            ));
        }
        if self.auth.max_refresh_tokens_per_user == 0 {
            return Err(Error::Config(
                "max_refresh_tokens_per_user must be > 0".to_string(),
            ));
        }
        if self.server.port == 0 {
            return Err(Error::Config("Server port must be > 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = Config::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.search.default_limit = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.enabled = true;
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn placeholder_jwt_secret_only_allowed_without_auth() {
        let mut config = Config::default();
        config.auth.jwt_secret = DEFAULT_JWT_SECRET.to_string();
        config.auth.enabled = false;
        assert!(config.validate().is_ok());

        config.auth.enabled = true;
        assert!(matches!(config.validate(), Err(crate::error::Error::Config(_))));

        config.auth.jwt_secret = "a-real-deployment-secret-value".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"chat": {"history_turns": 4, "history_ttl": {"secs": 60, "nanos": 0}, "context_results": 2}}"#).unwrap();
        assert_eq!(config.chat.history_turns, 4);
        assert_eq!(config.search.max_limit, 100);
    }
}
