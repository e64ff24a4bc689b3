//! Failures converted into data.
//!
//! Per-task errors never propagate as `Err` past the stage that produced
//! them; they become an [`ErrorRecord`] and travel with the run output.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Enrichment,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery => write!(f, "discovery"),
            Self::Enrichment => write!(f, "enrichment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Discovery deadline hit; the partition's partial items were kept.
    PartitionTimeout,
    /// Extractor error on a partition; it contributed zero items.
    PartitionFailure,
    /// Every attempt on one locator failed; the item was dropped.
    ItemFetchFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionTimeout => write!(f, "partition_timeout"),
            Self::PartitionFailure => write!(f, "partition_failure"),
            Self::ItemFetchFailure => write!(f, "item_fetch_failure"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub kind: ErrorKind,
    pub locator: Option<String>,
    pub partition: Option<String>,
    /// Display form of the final underlying cause.
    pub cause: String,
    /// Attempts spent before giving up.
    pub attempts: u32,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    #[must_use]
    pub fn partition(kind: ErrorKind, partition: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            stage: Stage::Discovery,
            kind,
            locator: None,
            partition: Some(partition.into()),
            cause: cause.to_string(),
            attempts: 1,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn item_fetch(
        locator: impl Into<String>,
        partition: impl Into<String>,
        cause: impl fmt::Display,
        attempts: u32,
    ) -> Self {
        Self {
            stage: Stage::Enrichment,
            kind: ErrorKind::ItemFetchFailure,
            locator: Some(locator.into()),
            partition: Some(partition.into()),
            cause: cause.to_string(),
            attempts,
            occurred_at: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.stage, self.kind)?;
        if let Some(locator) = &self.locator {
            write!(f, " {locator}")?;
        } else if let Some(partition) = &self.partition {
            write!(f, " {partition}")?;
        }
        write!(f, " after {} attempt(s): {}", self.attempts, self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_fetch_record_is_tagged_enrichment() {
        let record = ErrorRecord::item_fetch("u2", "tehran/buy-villa", "503 Service Unavailable", 3);
        assert_eq!(record.stage, Stage::Enrichment);
        assert_eq!(record.kind, ErrorKind::ItemFetchFailure);
        assert_eq!(record.to_string(), "[enrichment:item_fetch_failure] u2 after 3 attempt(s): 503 Service Unavailable");
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::PartitionTimeout).unwrap();
        assert_eq!(json, "\"partition_timeout\"");
    }
}
