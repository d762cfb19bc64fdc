//! Shared fixtures: every backend in memory and a canned language model.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;

use estate_rag::auth::{hash_password, Role};
use estate_rag::config::UserAccount;
use estate_rag::embedding::HashingEmbedder;
use estate_rag::generator::PropertyGenerator;
use estate_rag::llm::{ChatMessage, LanguageModel};
use estate_rag::search::{InMemoryPropertyRepository, InMemoryVectorIndex};
use estate_rag::{Config, EstateRag, RedisManager, Result};

pub const ANSWER: &str = "Here are a few listings that match what you asked for.";

/// Answers every prompt with [`ANSWER`], so intent detection falls back to
/// keyword rules. Records the prompts it was given and any model override.
#[derive(Default)]
pub struct CannedModel {
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
    pub overrides: Mutex<Vec<String>>,
}

#[async_trait]
impl LanguageModel for CannedModel {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.prompts.lock().push(messages.to_vec());
        Ok(ANSWER.to_string())
    }

    async fn complete_with_model(&self, model: &str, messages: &[ChatMessage]) -> Result<String> {
        self.overrides.lock().push(model.to_string());
        self.complete(messages).await
    }

    fn model_name(&self) -> &str {
        "canned"
    }
}

pub const PASSWORD: &str = "secret-password";

/// Hashed once per test binary and shared by every fixture account.
fn shared_hash() -> String {
    static HASH: OnceLock<String> = OnceLock::new();
    HASH.get_or_init(|| hash_password(PASSWORD).unwrap()).clone()
}

pub fn user(id: &str, role: Role) -> UserAccount {
    UserAccount {
        id: id.to_string(),
        username: id.to_string(),
        password_hash: shared_hash(),
        role,
    }
}

pub fn test_config(upload_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.auth.enabled = false;
    config.auth.jwt_secret = "integration-test-secret-0123456789".to_string();
    config.auth.users = vec![
        user("admin", Role::Admin),
        user("agent", Role::Agent),
        user("viewer", Role::Viewer),
    ];
    config.files.upload_dir = upload_dir.to_path_buf();
    config.server.rate_limit_per_minute = 0;
    config.batch.retry_base_delay = std::time::Duration::from_millis(1);
    config
}

pub fn build(config: Config) -> (Arc<EstateRag>, Arc<CannedModel>) {
    let model = Arc::new(CannedModel::default());
    let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimension));
    let rag = EstateRag::from_parts(
        config,
        Arc::new(RedisManager::in_memory()),
        Arc::new(InMemoryVectorIndex::new(embedder)),
        Arc::new(InMemoryPropertyRepository::new()),
        model.clone(),
    );
    (Arc::new(rag), model)
}

/// Services with `count` generated listings already ingested.
pub async fn seeded(config: Config, count: usize) -> Result<(Arc<EstateRag>, Arc<CannedModel>)> {
    let (rag, model) = build(config);
    let listings = PropertyGenerator::new(7).generate(count);
    rag.knowledge.ingest_properties(listings).await?;
    Ok((rag, model))
}
