//! Property listings: the record stored in the `properties` table, the
//! filter semantics shared by every structured backend, and the listing
//! data-quality score.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-sqft price band (AED) considered plausible for Dubai residential stock.
pub const PLAUSIBLE_PRICE_PER_SQFT: (f64, f64) = (300.0, 10_000.0);

/// Communities recognised in free-text queries and used by the generator.
pub const DUBAI_AREAS: &[&str] = &[
    "Dubai Marina",
    "Downtown Dubai",
    "Palm Jumeirah",
    "Business Bay",
    "Jumeirah Village Circle",
    "Jumeirah Lake Towers",
    "Jumeirah Beach Residence",
    "Dubai Hills Estate",
    "Arabian Ranches",
    "Dubai Creek Harbour",
    "DIFC",
    "Al Barsha",
    "Dubai Silicon Oasis",
    "Mirdif",
    "Meydan",
    "Damac Hills",
    "Town Square",
    "Emirates Hills",
    "International City",
    "Al Furjan",
];

pub const PROPERTY_TYPES: &[&str] = &["Apartment", "Villa", "Townhouse", "Penthouse", "Duplex"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Property {
    pub id: String,
    pub title: String,
    pub location: String,
    pub property_type: String,
    /// Asking price in AED.
    pub price: f64,
    pub bedrooms: i32,
    pub bathrooms: i32,
    pub area_sqft: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub developer: Option<String>,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default = "Utc::now")]
    pub listed_at: DateTime<Utc>,
}

impl Property {
    /// Text form used for vector indexing and for ranking boosts.
    pub fn to_content(&self) -> String {
        let rooms = if self.bedrooms == 0 {
            "Studio".to_string()
        } else {
            format!("{}-bedroom", self.bedrooms)
        };
        let mut content = format!(
            "{}. {} {} in {}, {:.0} sqft, {} bathrooms, priced at AED {:.0}.",
            self.title, rooms, self.property_type, self.location, self.area_sqft, self.bathrooms, self.price
        );
        if let Some(developer) = self.developer.as_deref().filter(|d| !d.is_empty()) {
            content.push_str(&format!(" Developer: {}.", developer));
        }
        if !self.amenities.is_empty() {
            content.push_str(&format!(" Amenities: {}.", self.amenities.join(", ")));
        }
        if !self.description.is_empty() {
            content.push(' ');
            content.push_str(&self.description);
        }
        content
    }

    /// Metadata attached to the vector index entry for this listing.
    pub fn vector_metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "source": "property",
            "property_id": self.id,
            "location": self.location,
            "property_type": self.property_type,
            "price": self.price,
            "bedrooms": self.bedrooms,
        })
    }

    pub fn price_per_sqft(&self) -> Option<f64> {
        if self.area_sqft > 0.0 && self.price.is_finite() && self.area_sqft.is_finite() {
            Some(self.price / self.area_sqft)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyFilters {
    /// Substring match, case-insensitive.
    pub location: Option<String>,
    /// Exact match, case-insensitive.
    pub property_type: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub bedrooms: Option<i32>,
}

impl PropertyFilters {
    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.property_type.is_none()
            && self.min_price.is_none()
            && self.max_price.is_none()
            && self.bedrooms.is_none()
    }

    pub fn matches(&self, property: &Property) -> bool {
        if let Some(location) = non_empty(&self.location) {
            if !property
                .location
                .to_lowercase()
                .contains(&location.to_lowercase())
            {
                return false;
            }
        }
        if let Some(kind) = non_empty(&self.property_type) {
            if !property.property_type.eq_ignore_ascii_case(kind) {
                return false;
            }
        }
        if let Some(min) = self.min_price {
            if property.price < min {
                return false;
            }
        }
        if let Some(max) = self.max_price {
            if property.price > max {
                return false;
            }
        }
        if let Some(bedrooms) = self.bedrooms {
            if property.bedrooms != bedrooms {
                return false;
            }
        }
        true
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Listing data-quality score in `[0, 1]`.
///
/// Weighted blend of field completeness (0.35), description depth (0.25),
/// price plausibility per sqft (0.25) and amenities coverage (0.15).
pub fn quality_score(property: &Property) -> f64 {
    let checks = [
        !property.title.trim().is_empty(),
        !property.location.trim().is_empty(),
        !property.property_type.trim().is_empty(),
        property.price.is_finite() && property.price > 0.0,
        property.area_sqft.is_finite() && property.area_sqft > 0.0,
        property.bedrooms >= 0,
        property.bathrooms >= 0,
        !property.description.trim().is_empty(),
        property
            .developer
            .as_deref()
            .map_or(false, |d| !d.trim().is_empty()),
    ];
    let completeness = checks.iter().filter(|c| **c).count() as f64 / checks.len() as f64;

    let words = property.description.split_whitespace().count() as f64;
    let description = (words / 50.0).min(1.0);

    let (low, high) = PLAUSIBLE_PRICE_PER_SQFT;
    let price = match property.price_per_sqft() {
        Some(pps) if pps.is_finite() && (low..=high).contains(&pps) => 1.0,
        Some(pps) if pps.is_finite() && (low / 2.0..=high * 2.0).contains(&pps) => 0.5,
        _ => 0.0,
    };

    let amenities = (property.amenities.len() as f64 / 5.0).min(1.0);

    let score = 0.35 * completeness + 0.25 * description + 0.25 * price + 0.15 * amenities;
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn listing() -> Property {
        Property {
            id: "p1".into(),
            title: "Marina View Apartment".into(),
            location: "Dubai Marina".into(),
            property_type: "Apartment".into(),
            price: 2_400_000.0,
            bedrooms: 2,
            bathrooms: 2,
            area_sqft: 1_350.0,
            description: "Bright corner unit with full marina views. ".repeat(10),
            developer: Some("Emaar".into()),
            amenities: vec!["Pool".into(), "Gym".into(), "Parking".into(), "Concierge".into(), "Balcony".into()],
            listed_at: Utc::now(),
        }
    }

    #[test]
    fn complete_listing_scores_high() {
        let score = quality_score(&listing());
        assert!(score > 0.95, "score was {score}");
    }

    #[test]
    fn implausible_price_loses_price_component() {
        let mut p = listing();
        p.price = 1_000.0;
        let score = quality_score(&p);
        assert!(score < 0.8);
        assert!(score >= 0.0);
    }

    #[test]
    fn content_mentions_location_and_type() {
        let mut p = listing();
        let content = p.to_content();
        assert!(content.contains("Dubai Marina"));
        assert!(content.contains("2-bedroom Apartment"));
        p.bedrooms = 0;
        assert!(p.to_content().contains("Studio Apartment"));
    }

    #[test]
    fn filters_apply_expected_semantics() {
        let p = listing();
        let mut f = PropertyFilters {
            location: Some("marina".into()),
            property_type: Some("apartment".into()),
            min_price: Some(2_000_000.0),
            max_price: Some(2_400_000.0),
            bedrooms: Some(2),
        };
        assert!(f.matches(&p));
        f.property_type = Some("villa".into());
        assert!(!f.matches(&p));
        f.property_type = Some("  ".into());
        assert!(f.matches(&p));
        f.max_price = Some(1.0);
        assert!(!f.matches(&p));
    }

    proptest! {
        #[test]
        fn score_always_in_unit_interval(
            price in proptest::num::f64::ANY,
            area in proptest::num::f64::ANY,
            bedrooms in any::<i32>(),
            words in 0usize..200,
            amenities in 0usize..20,
        ) {
            let mut p = listing();
            p.price = price;
            p.area_sqft = area;
            p.bedrooms = bedrooms;
            p.description = "word ".repeat(words);
            p.amenities = (0..amenities).map(|i| i.to_string()).collect();
            let score = quality_score(&p);
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
