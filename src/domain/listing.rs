//! Listing identity and detail data
//!
//! A [`CandidateItem`] is what pagination yields: a label plus a locator.
//! Its identity for dedup is the exact `(label, locator)` pair. Once detail
//! data is attached it becomes an [`EnrichedItem`], whose persistence
//! identity is the locator alone.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One independently discoverable slice of the source, e.g. `tehran/buy-villa`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePartition {
    pub locality: String,
    pub category: String,
    pub url: String,
}

impl SourcePartition {
    #[must_use]
    pub fn new(locality: impl Into<String>, category: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            locality: locality.into(),
            category: category.into(),
            url: url.into(),
        }
    }

    /// Human readable label used in logs, stats and error records.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.locality, self.category)
    }

    /// Enumerates every locality × category pair against `base_url`.
    ///
    /// The partition URL is `{base_url}{locality}/{category}`; a missing
    /// trailing slash on the base is tolerated.
    #[must_use]
    pub fn expand(base_url: &str, localities: &[String], categories: &[String]) -> Vec<Self> {
        let base = base_url.trim_end_matches('/');
        localities
            .iter()
            .flat_map(|locality| {
                categories.iter().map(move |category| {
                    Self::new(
                        locality.clone(),
                        category.clone(),
                        format!("{base}/{locality}/{category}"),
                    )
                })
            })
            .collect()
    }
}

impl fmt::Display for SourcePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.locality, self.category)
    }
}

/// Minimal identity produced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateItem {
    pub label: String,
    pub locator: String,
}

impl CandidateItem {
    #[must_use]
    pub fn new(label: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            locator: locator.into(),
        }
    }

    /// Blank (whitespace only) labels are never admitted into a candidate set.
    #[must_use]
    pub fn has_label(&self) -> bool {
        !self.label.trim().is_empty()
    }
}

/// Detail fields of one listing. Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailFields {
    /// Floor area in square metres.
    pub area: Option<f64>,
    pub rooms: Option<u32>,
    pub city: Option<String>,
    pub neighborhood: Option<String>,
    pub description: Option<String>,
    pub seller: Option<String>,
    /// Offer kind taken from the category chip, e.g. "buy" or "rent".
    pub ad_type: Option<String>,
    /// Property kind taken from the category chip, e.g. "apartment".
    pub house_type: Option<String>,
    pub floor: Option<i32>,
    /// Construction year as printed on the listing (not calendar converted).
    pub built_year: Option<u32>,
    pub price: Option<u64>,
    pub images: Vec<String>,
    pub posted_on: Option<NaiveDate>,
    pub has_elevator: Option<bool>,
    pub has_storage: Option<bool>,
    pub has_parking: Option<bool>,
}

impl DetailFields {
    /// Number of populated fields, used for log summaries.
    #[must_use]
    pub fn populated(&self) -> usize {
        let options = [
            self.area.is_some(),
            self.rooms.is_some(),
            self.city.is_some(),
            self.neighborhood.is_some(),
            self.description.is_some(),
            self.seller.is_some(),
            self.ad_type.is_some(),
            self.house_type.is_some(),
            self.floor.is_some(),
            self.built_year.is_some(),
            self.price.is_some(),
            !self.images.is_empty(),
            self.posted_on.is_some(),
            self.has_elevator.is_some(),
            self.has_storage.is_some(),
            self.has_parking.is_some(),
        ];
        options.iter().filter(|set| **set).count()
    }
}

/// A candidate with detail data attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedItem {
    pub label: String,
    pub locator: String,
    /// Label of the partition this occurrence was discovered in.
    pub partition: String,
    pub fields: DetailFields,
    pub enriched_at: DateTime<Utc>,
}

impl EnrichedItem {
    #[must_use]
    pub fn new(candidate: &CandidateItem, partition: impl Into<String>, fields: DetailFields) -> Self {
        Self {
            label: candidate.label.clone(),
            locator: candidate.locator.clone(),
            partition: partition.into(),
            fields,
            enriched_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_builds_cartesian_product() {
        let partitions = SourcePartition::expand(
            "https://divar.ir/s/",
            &["tehran".to_string(), "karaj".to_string()],
            &["buy-apartment".to_string(), "rent-villa".to_string()],
        );

        assert_eq!(partitions.len(), 4);
        assert_eq!(partitions[0].url, "https://divar.ir/s/tehran/buy-apartment");
        assert_eq!(partitions[3].label(), "karaj/rent-villa");
    }

    #[test]
    fn blank_label_is_rejected() {
        assert!(!CandidateItem::new("   ", "u1").has_label());
        assert!(CandidateItem::new("House 1", "u1").has_label());
    }

    #[test]
    fn populated_counts_only_present_fields() {
        let fields = DetailFields {
            area: Some(85.0),
            images: vec!["a.jpg".into()],
            has_parking: Some(false),
            ..Default::default()
        };
        assert_eq!(fields.populated(), 3);
    }
}
