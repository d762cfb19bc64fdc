//! Structured property backends: Postgres via sqlx, and an in-memory
//! repository with the same filter semantics.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::property::{Property, PropertyFilters};

#[async_trait]
pub trait PropertyRepository: Send + Sync {
    async fn search(&self, filters: &PropertyFilters, limit: usize) -> Result<Vec<Property>>;
    async fn get(&self, id: &str) -> Result<Option<Property>>;
    async fn upsert(&self, property: &Property) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    async fn health(&self) -> bool;
    fn name(&self) -> &'static str;
}

const PROPERTY_COLUMNS: &str = "id, title, location, property_type, price, bedrooms, bathrooms, \
     area_sqft, description, developer, amenities, listed_at";

const CREATE_PROPERTIES: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    location TEXT NOT NULL,
    property_type TEXT NOT NULL,
    price DOUBLE PRECISION NOT NULL,
    bedrooms INTEGER NOT NULL DEFAULT 0,
    bathrooms INTEGER NOT NULL DEFAULT 0,
    area_sqft DOUBLE PRECISION NOT NULL DEFAULT 0,
    description TEXT NOT NULL DEFAULT '',
    developer TEXT,
    amenities TEXT[] NOT NULL DEFAULT '{}',
    listed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)"#;

const CREATE_PROPERTIES_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_properties_location_type ON properties (location, property_type)";

/// Escape LIKE metacharacters so user input only matches literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub struct PgPropertyRepository {
    pool: PgPool,
}

impl PgPropertyRepository {
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;
        info!("Connected to Postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_PROPERTIES).execute(&self.pool).await?;
        sqlx::query(CREATE_PROPERTIES_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    fn build_search(filters: &PropertyFilters, limit: usize) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "SELECT {} FROM properties WHERE 1=1",
            PROPERTY_COLUMNS
        ));
        if let Some(location) = filters.location.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            qb.push(" AND location ILIKE ")
                .push_bind(format!("%{}%", escape_like(location)));
        }
        if let Some(kind) = filters
            .property_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            qb.push(" AND property_type ILIKE ").push_bind(escape_like(kind));
        }
        if let Some(min) = filters.min_price {
            qb.push(" AND price >= ").push_bind(min);
        }
        if let Some(max) = filters.max_price {
            qb.push(" AND price <= ").push_bind(max);
        }
        if let Some(bedrooms) = filters.bedrooms {
            qb.push(" AND bedrooms = ").push_bind(bedrooms);
        }
        qb.push(" ORDER BY price ASC, id ASC LIMIT ")
            .push_bind(limit as i64);
        qb
    }
}

#[async_trait]
impl PropertyRepository for PgPropertyRepository {
    #[instrument(skip(self))]
    async fn search(&self, filters: &PropertyFilters, limit: usize) -> Result<Vec<Property>> {
        let mut qb = Self::build_search(filters, limit);
        let rows = qb.build_query_as::<Property>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn get(&self, id: &str) -> Result<Option<Property>> {
        let sql = format!("SELECT {} FROM properties WHERE id = $1", PROPERTY_COLUMNS);
        Ok(sqlx::query_as::<_, Property>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn upsert(&self, property: &Property) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO properties
                (id, title, location, property_type, price, bedrooms, bathrooms,
                 area_sqft, description, developer, amenities, listed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                location = EXCLUDED.location,
                property_type = EXCLUDED.property_type,
                price = EXCLUDED.price,
                bedrooms = EXCLUDED.bedrooms,
                bathrooms = EXCLUDED.bathrooms,
                area_sqft = EXCLUDED.area_sqft,
                description = EXCLUDED.description,
                developer = EXCLUDED.developer,
                amenities = EXCLUDED.amenities,
                listed_at = EXCLUDED.listed_at
            "#,
        )
        .bind(&property.id)
        .bind(&property.title)
        .bind(&property.location)
        .bind(&property.property_type)
        .bind(property.price)
        .bind(property.bedrooms)
        .bind(property.bathrooms)
        .bind(property.area_sqft)
        .bind(&property.description)
        .bind(&property.developer)
        .bind(&property.amenities)
        .bind(property.listed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM properties")
            .fetch_one(&self.pool)
            .await?;
        usize::try_from(count).map_err(|_| Error::Database(format!("negative row count {}", count)))
    }

    async fn health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[derive(Default)]
pub struct InMemoryPropertyRepository {
    rows: RwLock<BTreeMap<String, Property>>,
}

impl InMemoryPropertyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: impl IntoIterator<Item = Property>) -> Self {
        let repo = Self::new();
        {
            let mut rows = repo.rows.write();
            for p in properties {
                rows.insert(p.id.clone(), p);
            }
        }
        repo
    }
}

#[async_trait]
impl PropertyRepository for InMemoryPropertyRepository {
    async fn search(&self, filters: &PropertyFilters, limit: usize) -> Result<Vec<Property>> {
        let rows = self.rows.read();
        let mut matched: Vec<Property> = rows.values().filter(|p| filters.matches(p)).cloned().collect();
        matched.sort_by(|a, b| a.price.total_cmp(&b.price).then_with(|| a.id.cmp(&b.id)));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn get(&self, id: &str) -> Result<Option<Property>> {
        Ok(self.rows.read().get(id).cloned())
    }

    async fn upsert(&self, property: &Property) -> Result<()> {
        self.rows.write().insert(property.id.clone(), property.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().len())
    }

    async fn health(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
