//! Output seams: where a run's results and stats go.
//!
//! Implementations own their schema. A [`ListingSink`] must treat a repeated
//! locator as an update; aggregation never deduplicates on its behalf.

use async_trait::async_trait;

use super::monitor::StatsSnapshot;
use crate::domain::{EnrichedItem, ErrorRecord};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ListingSink: Send + Sync {
    /// Insert or update by locator.
    async fn upsert(&self, item: &EnrichedItem) -> Result<(), SinkError>;

    async fn record_errors(&self, errors: &[ErrorRecord]) -> Result<(), SinkError>;
}

#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn write(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError>;
}
