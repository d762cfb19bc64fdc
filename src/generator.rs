//! Seeded synthetic Dubai listings and area guides for demos, load tests
//! and local development.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::property::{Property, DUBAI_AREAS, PROPERTY_TYPES};

/// Typical asking price per sqft (AED) by community.
fn base_price_per_sqft(area: &str) -> f64 {
    match area {
        "Palm Jumeirah" | "Emirates Hills" => 3_200.0,
        "Downtown Dubai" | "DIFC" => 2_600.0,
        "Dubai Marina" | "Jumeirah Beach Residence" | "Dubai Hills Estate" => 2_000.0,
        "Business Bay" | "Dubai Creek Harbour" | "Meydan" => 1_800.0,
        "Arabian Ranches" | "Jumeirah Lake Towers" | "Al Barsha" => 1_450.0,
        "Jumeirah Village Circle" | "Damac Hills" | "Al Furjan" | "Mirdif" => 1_150.0,
        "Town Square" | "Dubai Silicon Oasis" => 950.0,
        "International City" => 650.0,
        _ => 1_300.0,
    }
}

const DEVELOPERS: &[&str] = &["Emaar", "Nakheel", "Damac", "Meraas", "Sobha", "Azizi", "Ellington", "Select Group"];

const AMENITIES: &[&str] = &[
    "Swimming Pool",
    "Gym",
    "Covered Parking",
    "Balcony",
    "Concierge",
    "Kids Play Area",
    "Private Garden",
    "Maid's Room",
    "Sea View",
    "Burj Khalifa View",
    "Built-in Wardrobes",
    "Security",
];

const HIGHLIGHTS: &[&str] = &[
    "Bright interiors with floor-to-ceiling windows.",
    "Walking distance to the metro and retail.",
    "Recently upgraded kitchen and bathrooms.",
    "Quiet community with landscaped parks.",
    "Vacant on transfer and ready to move in.",
    "Tenanted with a strong rental yield.",
    "High floor unit with open views.",
    "Close to schools and nurseries.",
];

pub struct PropertyGenerator {
    rng: StdRng,
    anchor: DateTime<Utc>,
    next_id: usize,
}

impl PropertyGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            anchor: Utc::now(),
            next_id: 1,
        }
    }

    /// Fix the reference time that `listed_at` dates count back from.
    pub fn with_anchor(mut self, anchor: DateTime<Utc>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn generate(&mut self, count: usize) -> Vec<Property> {
        (0..count).map(|_| self.listing()).collect()
    }

    fn pick<'a>(&mut self, options: &'a [&'a str]) -> &'a str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }

    fn listing(&mut self) -> Property {
        let id = format!("DXB-{:06}", self.next_id);
        self.next_id += 1;

        let location = self.pick(DUBAI_AREAS);
        let property_type = self.pick(PROPERTY_TYPES);
        let bedrooms: i32 = match property_type {
            "Villa" => self.rng.gen_range(3..=7),
            "Townhouse" => self.rng.gen_range(2..=5),
            "Penthouse" => self.rng.gen_range(3..=6),
            "Duplex" => self.rng.gen_range(2..=4),
            _ => self.rng.gen_range(0..=4),
        };
        let bathrooms = if bedrooms == 0 { 1 } else { bedrooms + self.rng.gen_range(0..=1) };

        let per_room = match property_type {
            "Villa" => 1_100.0,
            "Townhouse" => 800.0,
            "Penthouse" => 1_000.0,
            _ => 650.0,
        };
        let area_sqft = ((450.0 + per_room * bedrooms as f64) * self.rng.gen_range(0.85..1.25)).round();

        let premium = match property_type {
            "Penthouse" => 1.5,
            "Villa" => 1.1,
            _ => 1.0,
        };
        let ppsf = base_price_per_sqft(location) * premium * self.rng.gen_range(0.8..1.2);
        let price = ((area_sqft * ppsf) / 5_000.0).round() * 5_000.0;

        let rooms = if bedrooms == 0 {
            "Studio".to_string()
        } else {
            format!("{} BR", bedrooms)
        };
        let title = format!("{} {} in {}", rooms, property_type, location);

        let amenity_count = self.rng.gen_range(2..=6);
        let mut amenities: Vec<String> = AMENITIES
            .choose_multiple(&mut self.rng, amenity_count)
            .map(|s| s.to_string())
            .collect();
        amenities.sort();

        let mut description = vec![format!(
            "{} {} located in {}.",
            if bedrooms == 0 { "Studio".to_string() } else { format!("Spacious {}-bedroom", bedrooms) },
            property_type.to_lowercase(),
            location
        )];
        for highlight in HIGHLIGHTS.choose_multiple(&mut self.rng, 2) {
            description.push(highlight.to_string());
        }

        let developer = if self.rng.gen_bool(0.85) {
            Some(self.pick(DEVELOPERS).to_string())
        } else {
            None
        };

        Property {
            id,
            title,
            location: location.to_string(),
            property_type: property_type.to_string(),
            price,
            bedrooms,
            bathrooms,
            area_sqft,
            description: description.join(" "),
            developer,
            amenities,
            listed_at: self.anchor - Duration::days(self.rng.gen_range(0..180)),
        }
    }
}

/// One short market guide per community, suitable for knowledge-base ingestion.
pub fn area_guides() -> Vec<(String, Value)> {
    DUBAI_AREAS
        .iter()
        .map(|area| {
            let ppsf = base_price_per_sqft(area);
            let content = format!(
                "{area} market guide. Typical asking prices in {area} are around AED {ppsf:.0} per square foot. \
                 A 1,000 sqft apartment in {area} would typically be listed near AED {total:.0}. \
                 Buyers should budget roughly 4% of the price for the Dubai Land Department transfer fee \
                 plus agency commission, and freehold ownership is available to foreign buyers in designated areas.",
                area = area,
                ppsf = ppsf,
                total = ppsf * 1_000.0,
            );
            (
                content,
                json!({"location": area, "category": "market_guide"}),
            )
        })
        .collect()
}
