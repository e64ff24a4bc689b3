//! Writes resource monitor snapshots as `task_stats_<timestamp>.json`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::crawling::monitor::StatsSnapshot;
use crate::crawling::sink::{SinkError, StatsSink};

pub struct JsonStatsSink {
    output_dir: PathBuf,
}

impl JsonStatsSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// File the given snapshot is written to.
    #[must_use]
    pub fn path_for(&self, snapshot: &StatsSnapshot) -> PathBuf {
        let stamp = snapshot.taken_at.format("%Y%m%d_%H%M%S_%3f");
        self.output_dir.join(format!("task_stats_{stamp}.json"))
    }
}

#[async_trait]
impl StatsSink for JsonStatsSink {
    async fn write(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.path_for(snapshot);
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&path, body).await?;
        info!(tasks = snapshot.tasks.len(), "Task stats written to {}", path.display());
        Ok(())
    }
}
