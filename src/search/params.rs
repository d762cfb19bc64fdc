use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::property::PropertyFilters;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Vector,
    Structured,
    #[default]
    Hybrid,
}

impl SearchMode {
    pub fn uses_vector(self) -> bool {
        matches!(self, SearchMode::Vector | SearchMode::Hybrid)
    }
}

impl std::str::FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "vector" => Ok(SearchMode::Vector),
            "structured" | "sql" => Ok(SearchMode::Structured),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(Error::InvalidInput(format!("unknown search mode: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub mode: SearchMode,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub property_type: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub bedrooms: Option<i32>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_filters(mut self, filters: PropertyFilters) -> Self {
        self.location = filters.location;
        self.property_type = filters.property_type;
        self.min_price = filters.min_price;
        self.max_price = filters.max_price;
        self.bedrooms = filters.bedrooms;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filters(&self) -> PropertyFilters {
        PropertyFilters {
            location: self.location.clone(),
            property_type: self.property_type.clone(),
            min_price: self.min_price,
            max_price: self.max_price,
            bedrooms: self.bedrooms,
        }
    }

    /// Trim strings, drop empty filters, clamp the limit, and reject
    /// parameter sets that cannot produce a meaningful search. Normalizing
    /// before hashing makes equivalent requests share one cache entry.
    pub fn normalized(mut self, default_limit: usize, max_limit: usize) -> Result<Self> {
        self.query = self.query.trim().to_string();
        self.location = clean(self.location);
        self.property_type = clean(self.property_type);

        let limit = self.limit.unwrap_or(default_limit);
        if limit == 0 {
            return Err(Error::InvalidInput("limit must be greater than zero".to_string()));
        }
        self.limit = Some(limit.min(max_limit));

        for price in [self.min_price, self.max_price].into_iter().flatten() {
            if !price.is_finite() || price < 0.0 {
                return Err(Error::InvalidInput(format!("invalid price bound: {}", price)));
            }
        }
        if let (Some(min), Some(max)) = (self.min_price, self.max_price) {
            if min > max {
                return Err(Error::InvalidInput(format!(
                    "min_price ({}) exceeds max_price ({})",
                    min, max
                )));
            }
        }
        if matches!(self.bedrooms, Some(b) if b < 0) {
            return Err(Error::InvalidInput("bedrooms cannot be negative".to_string()));
        }

        if self.query.is_empty() && self.mode.uses_vector() {
            if self.mode == SearchMode::Hybrid && !self.filters().is_empty() {
                // Filters alone still make a valid structured search.
                self.mode = SearchMode::Structured;
            } else {
                return Err(Error::InvalidInput("query cannot be empty".to_string()));
            }
        }
        Ok(self)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(10)
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
