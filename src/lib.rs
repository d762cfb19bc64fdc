pub mod api;
pub mod auth;
pub mod batch;
pub mod cache;
pub mod chat;
pub mod config;
pub mod embedding;
pub mod error;
pub mod files;
pub mod generator;
pub mod knowledge;
pub mod llm;
pub mod models;
pub mod property;
pub mod redis_backend;
pub mod search;

pub use auth::{AuthUser, RbacManager, Role, TokenManager};
pub use batch::{BatchJob, BatchProcessor, JobStatus};
pub use cache::CacheManager;
pub use chat::{ChatResponse, ChatService, Intent};
pub use config::Config;
pub use error::{Error, Result};
pub use knowledge::KnowledgeBase;
pub use llm::{LanguageModel, OpenAiChatClient};
pub use models::ModelRegistry;
pub use property::{Property, PropertyFilters};
pub use redis_backend::RedisManager;
pub use search::{HybridSearchEngine, SearchMode, SearchParams, SearchResponse};

use std::sync::Arc;

use embedding::EmbeddingFactory;
use files::{FileStore, FileValidator};
use search::{
    ChromaClient, InMemoryPropertyRepository, InMemoryVectorIndex, PgPropertyRepository,
    PropertyRepository, VectorBackend,
};

/// Every service the API and CLI need, wired from one configuration.
pub struct EstateRag {
    pub config: Arc<Config>,
    pub redis: Arc<RedisManager>,
    pub engine: Arc<HybridSearchEngine>,
    pub knowledge: Arc<KnowledgeBase>,
    pub chat: Arc<ChatService>,
    pub tokens: Arc<TokenManager>,
    pub rbac: RbacManager,
    pub models: Arc<ModelRegistry>,
    pub batch: BatchProcessor,
    pub file_validator: FileValidator,
    pub file_store: FileStore,
}

impl EstateRag {
    /// Connect to the configured backends. Without `DATABASE_URL` or
    /// `CHROMA_URL` the corresponding backend runs in memory.
    pub async fn new(config: Config) -> Result<Self> {
        let redis = Arc::new(RedisManager::new(&config.redis).await?);
        let embedder = EmbeddingFactory::create(&config.embedding);

        let vector: Arc<dyn VectorBackend> = match &config.vector_store.chroma_url {
            Some(url) => {
                tracing::info!(url = %url, collection = %config.vector_store.collection, "Using ChromaDB vector backend");
                Arc::new(ChromaClient::new(url.clone(), &config.vector_store, embedder)?)
            }
            None => {
                tracing::warn!("CHROMA_URL not set, using in-memory vector index");
                Arc::new(InMemoryVectorIndex::new(embedder))
            }
        };

        let structured: Arc<dyn PropertyRepository> = match &config.database.url {
            Some(url) => {
                let repo = PgPropertyRepository::connect(url, &config.database).await?;
                if config.database.run_migrations {
                    repo.migrate().await?;
                }
                Arc::new(repo)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory property repository");
                Arc::new(InMemoryPropertyRepository::new())
            }
        };

        let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiChatClient::new(&config.llm)?);
        Ok(Self::from_parts(config, redis, vector, structured, llm))
    }

    /// Assemble the services over already-constructed backends.
    pub fn from_parts(
        config: Config,
        redis: Arc<RedisManager>,
        vector: Arc<dyn VectorBackend>,
        structured: Arc<dyn PropertyRepository>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let cache = CacheManager::new(redis.clone(), "search", config.search.cache_ttl);
        let engine = Arc::new(HybridSearchEngine::new(
            vector,
            structured,
            cache,
            config.search.clone(),
        ));
        let knowledge = Arc::new(KnowledgeBase::new(engine.clone(), config.knowledge.clone()));
        let models = Arc::new(ModelRegistry::new(redis.clone()));
        let chat = Arc::new(ChatService::new(
            engine.clone(),
            llm,
            models.clone(),
            redis.clone(),
            config.chat.clone(),
        ));
        let tokens = Arc::new(TokenManager::new(redis.clone(), &config.auth));
        let batch = BatchProcessor::new(config.batch.clone());
        let file_validator = FileValidator::new(&config.files);
        let file_store = FileStore::new(config.files.upload_dir.clone());

        tracing::info!(
            vector_backend = engine.vector_backend().name(),
            structured_backend = engine.structured_backend().name(),
            redis_fallback = redis.is_fallback(),
            "estate-rag services initialized"
        );

        Self {
            config: Arc::new(config),
            redis,
            engine,
            knowledge,
            chat,
            tokens,
            rbac: RbacManager::new(),
            models,
            batch,
            file_validator,
            file_store,
        }
    }
}
