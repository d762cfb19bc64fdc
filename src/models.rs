//! Registry of the models the service can use (chat, embedding, intent
//! classification), with one active model per task.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::redis_backend::RedisManager;

const REGISTRY_KEY: &str = "models:registry";
const ACTIVE_KEY: &str = "models:active";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub task: String,
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterModel {
    pub name: String,
    pub version: String,
    pub task: String,
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

pub struct ModelRegistry {
    redis: Arc<RedisManager>,
}

impl ModelRegistry {
    pub fn new(redis: Arc<RedisManager>) -> Self {
        Self { redis }
    }

    async fn load(&self, id: &str) -> Result<ModelRecord> {
        let raw = self
            .redis
            .hget(REGISTRY_KEY, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("model {}", id)))?;
        let mut record: ModelRecord = serde_json::from_slice(&raw)?;
        record.active = self.active_id(&record.task).await?.as_deref() == Some(id);
        Ok(record)
    }

    async fn active_id(&self, task: &str) -> Result<Option<String>> {
        Ok(self
            .redis
            .hget(ACTIVE_KEY, task)
            .await?
            .and_then(|raw| String::from_utf8(raw).ok()))
    }

    pub async fn register(&self, request: RegisterModel) -> Result<ModelRecord> {
        for (field, value) in [
            ("name", &request.name),
            ("version", &request.version),
            ("task", &request.task),
            ("provider", &request.provider),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidInput(format!("model {} is required", field)));
            }
        }
        let task = request.task.trim().to_lowercase();
        let existing = self.list(Some(&task)).await?;
        if existing
            .iter()
            .any(|m| m.name == request.name && m.version == request.version)
        {
            return Err(Error::InvalidInput(format!(
                "{} {} is already registered for {}",
                request.name, request.version, task
            )));
        }

        let record = ModelRecord {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            version: request.version,
            task,
            provider: request.provider,
            endpoint: request.endpoint,
            parameters: request.parameters,
            created_at: Utc::now(),
            active: false,
        };
        self.redis
            .hset(REGISTRY_KEY, &record.id, &serde_json::to_vec(&record)?)
            .await?;
        info!(model_id = %record.id, name = %record.name, task = %record.task, "model registered");
        Ok(record)
    }

    pub async fn list(&self, task: Option<&str>) -> Result<Vec<ModelRecord>> {
        let all = self.redis.hgetall(REGISTRY_KEY).await?;
        let active = self.redis.hgetall(ACTIVE_KEY).await?;
        let mut records: Vec<ModelRecord> = all
            .values()
            .filter_map(|raw| serde_json::from_slice::<ModelRecord>(raw).ok())
            .filter(|m| task.map_or(true, |t| m.task.eq_ignore_ascii_case(t)))
            .map(|mut m| {
                m.active = active.get(&m.task).map(|id| id.as_slice()) == Some(m.id.as_bytes());
                m
            })
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    pub async fn get(&self, id: &str) -> Result<ModelRecord> {
        self.load(id).await
    }

    /// Make `id` the active model for its task, replacing any previous one.
    pub async fn activate(&self, id: &str) -> Result<ModelRecord> {
        let mut record = self.load(id).await?;
        self.redis.hset(ACTIVE_KEY, &record.task, id.as_bytes()).await?;
        record.active = true;
        info!(model_id = id, task = %record.task, "model activated");
        Ok(record)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let record = self.load(id).await?;
        if record.active {
            self.redis.hdel(ACTIVE_KEY, &record.task).await?;
        }
        self.redis.hdel(REGISTRY_KEY, id).await?;
        info!(model_id = id, "model deleted");
        Ok(())
    }

    pub async fn active_for(&self, task: &str) -> Result<Option<ModelRecord>> {
        match self.active_id(&task.to_lowercase()).await? {
            Some(id) => match self.load(&id).await {
                Ok(record) => Ok(Some(record)),
                Err(Error::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }
}
