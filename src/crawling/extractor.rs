//! Page extraction seam.
//!
//! The core never touches HTTP, a browser or selectors. It drives a
//! [`PageExtractor`] through two handles:
//! - a [`ScrollSession`] per partition, which exposes the scroll marker,
//!   the currently visible candidates and the "load more" affordance;
//! - a [`DetailPage`] per locator, from which each detail field is read.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::retry::Retryable;
use super::scope::Interrupted;
use crate::domain::{CandidateItem, SourcePartition};

/// Field groups a detail page can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailField {
    Area,
    Rooms,
    /// Location line, e.g. "Apartment in Tehran, Niavaran".
    Subtitle,
    Description,
    Seller,
    /// "<ad type> <house type>" chip.
    CategoryChip,
    /// Feature labels (elevator, storage, parking ...).
    Amenities,
    Floor,
    BuiltYear,
    Price,
    Images,
    /// Page title, which carries the posting date.
    Title,
}

impl DetailField {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Area => "area",
            Self::Rooms => "rooms",
            Self::Subtitle => "subtitle",
            Self::Description => "description",
            Self::Seller => "seller",
            Self::CategoryChip => "category_chip",
            Self::Amenities => "amenities",
            Self::Floor => "floor",
            Self::BuiltYear => "built_year",
            Self::Price => "price",
            Self::Images => "images",
            Self::Title => "title",
        }
    }
}

impl fmt::Display for DetailField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("field '{0}' not present")]
    FieldMissing(DetailField),

    #[error("could not parse {field} from {value:?}")]
    Parse { field: DetailField, value: String },
}

impl ExtractError {
    pub fn navigation(url: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Navigation {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error came from the run scope ending.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

impl Retryable for ExtractError {
    fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Interrupted> for ExtractError {
    fn from(reason: Interrupted) -> Self {
        match reason {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::Timeout(reason.to_string()),
        }
    }
}

#[async_trait]
pub trait PageExtractor: Send + Sync {
    /// Navigate to a partition's listing page.
    async fn open_partition(&self, partition: &SourcePartition) -> Result<Box<dyn ScrollSession>, ExtractError>;

    /// Navigate to one item's detail page. Fails only for whole-page problems.
    async fn open_detail(&self, locator: &str) -> Result<Box<dyn DetailPage>, ExtractError>;
}

/// A partition page being paginated.
#[async_trait]
pub trait ScrollSession: Send {
    /// Opaque position marker (rendered height, card count ...). Unchanged
    /// between rounds means nothing new was rendered.
    async fn scroll_marker(&mut self) -> Result<u64, ExtractError>;

    /// Every candidate currently rendered, in page order, duplicates included.
    async fn visible_items(&mut self) -> Result<Vec<CandidateItem>, ExtractError>;

    async fn scroll(&mut self) -> Result<(), ExtractError>;

    /// Trigger the "load more" affordance. `Ok(false)` when there is none.
    async fn load_more(&mut self) -> Result<bool, ExtractError>;
}

/// A loaded detail page.
#[async_trait]
pub trait DetailPage: Send + Sync {
    /// First text value of `field`.
    async fn read_text(&self, field: DetailField) -> Result<String, ExtractError>;

    /// Every value of `field` (image URLs, feature labels).
    async fn read_all(&self, field: DetailField) -> Result<Vec<String>, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cancellation_stops_retries() {
        assert!(ExtractError::Cancelled.is_cancellation());
        assert!(!ExtractError::Timeout("deadline exceeded".into()).is_cancellation());
        assert!(!ExtractError::Http { status: 503, url: "u".into() }.is_cancellation());
    }

    #[test]
    fn interrupted_maps_to_extract_error() {
        assert_eq!(ExtractError::from(Interrupted::Cancelled), ExtractError::Cancelled);
        assert!(matches!(
            ExtractError::from(Interrupted::DeadlineExceeded),
            ExtractError::Timeout(_)
        ));
    }
}
