//! # Crawl Orchestrator
//!
//! Schedules runs and drives one run end to end:
//! discovery fan-out, cross-partition merge, enrichment fan-out, aggregation,
//! stats snapshot, then hand-off to the listing sink.
//!
//! `Idle -> (tick | manual trigger) -> Running -> Idle`. A tick only starts a
//! run once `min_time_between_runs` has passed since the previous run ended.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregation::Aggregator;
use super::discovery::{DiscoveryPolicy, DiscoveryStage, dedupe_by_locator};
use super::enrichment::{EnrichmentPolicy, EnrichmentStage};
use super::extractor::PageExtractor;
use super::limiter::ConcurrencyLimiter;
use super::monitor::ResourceMonitor;
use super::retry::{RetryExecutor, RetryPolicy};
use super::scope::RunScope;
use super::sink::{ListingSink, StatsSink};
use crate::domain::{ErrorRecord, SourcePartition};

/// Everything the orchestrator consumes from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Ticker period.
    pub run_interval: Duration,
    /// Minimum gap between the end of one run and the start of the next.
    pub min_time_between_runs: Duration,
    /// Deadline covering discovery, enrichment and aggregation of one run.
    pub page_timeout: Duration,
    pub max_partition_concurrency: usize,
    pub max_item_concurrency: usize,
    pub partitions: Vec<SourcePartition>,
    pub retry: RetryPolicy,
    pub discovery: DiscoveryPolicy,
    pub enrichment: EnrichmentPolicy,
    pub sample_interval: Duration,
    /// Drop repeated locators across partitions before enrichment.
    pub dedupe_across_partitions: bool,
    /// Buffer size of the aggregation channels.
    pub result_buffer: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            run_interval: Duration::from_secs(defaults::RUN_INTERVAL_SECS),
            min_time_between_runs: Duration::from_secs(defaults::MIN_TIME_BETWEEN_RUNS_SECS),
            page_timeout: Duration::from_secs(defaults::PAGE_TIMEOUT_SECS),
            max_partition_concurrency: defaults::MAX_PARTITION_CONCURRENCY,
            max_item_concurrency: defaults::MAX_ITEM_CONCURRENCY,
            partitions: SourcePartition::expand(
                defaults::BASE_URL,
                &defaults::localities(),
                &defaults::categories(),
            ),
            retry: RetryPolicy::default(),
            discovery: DiscoveryPolicy::default(),
            enrichment: EnrichmentPolicy::default(),
            sample_interval: Duration::from_millis(defaults::SAMPLE_INTERVAL_MS),
            dedupe_across_partitions: false,
            result_buffer: defaults::RESULT_BUFFER,
        }
    }
}

/// Summary of one run, returned to the caller and logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub partitions: usize,
    pub partitions_timed_out: usize,
    pub partitions_failed: usize,
    pub candidates: usize,
    pub duplicates_skipped: usize,
    pub enriched: usize,
    pub item_failures: usize,
    pub upsert_failures: usize,
    pub discovery_errors: Vec<ErrorRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Nothing was discovered in any partition; the only error a run returns.
    #[error("run aborted: no items discovered across {partitions} partition(s)")]
    RunAborted {
        partitions: usize,
        discovery_errors: Vec<ErrorRecord>,
    },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Default)]
struct RunRecord {
    last_run: Option<Instant>,
    last_run_at: Option<DateTime<Utc>>,
    runs: u64,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    discovery: Arc<DiscoveryStage>,
    enrichment: Arc<EnrichmentStage>,
    monitor: ResourceMonitor,
    listing_sink: Arc<dyn ListingSink>,
    stats_sink: Arc<dyn StatsSink>,
    record: Mutex<RunRecord>,
}

impl Orchestrator {
    /// Builds the stages with a process resource sampler.
    pub fn new(
        settings: OrchestratorSettings,
        extractor: Arc<dyn PageExtractor>,
        listing_sink: Arc<dyn ListingSink>,
        stats_sink: Arc<dyn StatsSink>,
    ) -> Result<Self, OrchestratorError> {
        let monitor = ResourceMonitor::with_process_sampler(settings.sample_interval);
        Self::with_monitor(settings, extractor, listing_sink, stats_sink, monitor)
    }

    pub fn with_monitor(
        settings: OrchestratorSettings,
        extractor: Arc<dyn PageExtractor>,
        listing_sink: Arc<dyn ListingSink>,
        stats_sink: Arc<dyn StatsSink>,
        monitor: ResourceMonitor,
    ) -> Result<Self, OrchestratorError> {
        if settings.partitions.is_empty() {
            return Err(OrchestratorError::InvalidSettings("no source partitions".into()));
        }
        if settings.max_partition_concurrency == 0 || settings.max_item_concurrency == 0 {
            return Err(OrchestratorError::InvalidSettings("concurrency limits must be positive".into()));
        }

        let discovery = DiscoveryStage::new(
            Arc::clone(&extractor),
            settings.discovery,
            ConcurrencyLimiter::new("partitions", settings.max_partition_concurrency),
            monitor.clone(),
        );
        let enrichment = EnrichmentStage::new(
            extractor,
            RetryExecutor::new(settings.retry),
            ConcurrencyLimiter::new("items", settings.max_item_concurrency),
            monitor.clone(),
            settings.enrichment,
        );

        Ok(Self {
            settings,
            discovery: Arc::new(discovery),
            enrichment: Arc::new(enrichment),
            monitor,
            listing_sink,
            stats_sink,
            record: Mutex::new(RunRecord::default()),
        })
    }

    #[must_use]
    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    #[must_use]
    pub fn partition_limiter(&self) -> &ConcurrencyLimiter {
        self.discovery.limiter()
    }

    #[must_use]
    pub fn item_limiter(&self) -> &ConcurrencyLimiter {
        self.enrichment.limiter()
    }

    /// Monotonic end time of the last run.
    pub async fn last_run(&self) -> Option<Instant> {
        self.record.lock().await.last_run
    }

    pub async fn last_run_at(&self) -> Option<DateTime<Utc>> {
        self.record.lock().await.last_run_at
    }

    pub async fn runs_completed(&self) -> u64 {
        self.record.lock().await.runs
    }

    /// One immediate run, then a `check_and_run` per tick until `shutdown`.
    pub async fn start(&self, shutdown: CancellationToken) {
        info!(
            partitions = self.settings.partitions.len(),
            run_interval_secs = self.settings.run_interval.as_secs(),
            min_gap_secs = self.settings.min_time_between_runs.as_secs(),
            "Orchestrator started"
        );

        log_outcome(self.run_once(&shutdown).await.map(Some));

        let period = self.settings.run_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, orchestrator stopping");
                    break;
                }
                _ = ticker.tick() => {
                    log_outcome(self.check_and_run(&shutdown).await);
                }
            }
        }
    }

    /// Runs only if enough time has passed since the last run; a skipped
    /// tick returns `Ok(None)`.
    pub async fn check_and_run(&self, shutdown: &CancellationToken) -> Result<Option<RunReport>, OrchestratorError> {
        let mut record = self.record.lock().await;
        if let Some(last) = record.last_run {
            let elapsed = last.elapsed();
            if elapsed < self.settings.min_time_between_runs {
                debug!(
                    elapsed_secs = elapsed.as_secs(),
                    min_gap_secs = self.settings.min_time_between_runs.as_secs(),
                    "Skipping tick, previous run too recent"
                );
                return Ok(None);
            }
        }
        self.run_locked(&mut record, shutdown).await.map(Some)
    }

    /// Runs now, regardless of the last run time.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<RunReport, OrchestratorError> {
        let mut record = self.record.lock().await;
        self.run_locked(&mut record, shutdown).await
    }

    async fn run_locked(
        &self,
        record: &mut RunRecord,
        shutdown: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let result = self.execute(shutdown).await;
        record.last_run = Some(Instant::now());
        record.last_run_at = Some(Utc::now());
        record.runs += 1;
        result
    }

    async fn execute(&self, shutdown: &CancellationToken) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let partitions = &self.settings.partitions;
        let scope = RunScope::with_token(shutdown.child_token(), self.settings.page_timeout);
        info!(%run_id, partitions = partitions.len(), "Run started");

        let (error_tx, mut error_rx) = mpsc::channel(partitions.len().max(1));
        let discovered = self.discovery.run(partitions, &scope, error_tx).await;
        let mut discovery_errors = Vec::new();
        while let Ok(record) = error_rx.try_recv() {
            discovery_errors.push(record);
        }

        let mut candidates = discovered.candidates;
        let found = candidates.len();
        let mut duplicates_skipped = 0;
        if self.settings.dedupe_across_partitions {
            let (kept, dropped) = dedupe_by_locator(candidates);
            candidates = kept;
            duplicates_skipped = dropped;
        }
        info!(
            %run_id,
            candidates = found,
            duplicates_skipped,
            timed_out = discovered.timed_out,
            failed = discovered.failed,
            "Discovery complete"
        );

        if candidates.is_empty() {
            scope.cancel();
            self.finish_monitoring().await;
            self.record_errors(&discovery_errors).await;
            error!(%run_id, "No items discovered in any partition");
            return Err(OrchestratorError::RunAborted {
                partitions: partitions.len(),
                discovery_errors,
            });
        }

        let buffer = self.settings.result_buffer.max(1);
        let (item_tx, item_rx) = mpsc::channel(buffer);
        let (failure_tx, failure_rx) = mpsc::channel(buffer);
        let workers = self.enrichment.spawn_workers(candidates, &scope, item_tx, failure_tx);
        let output = Aggregator::collect(item_rx, failure_rx).await;
        workers.wait().await;
        scope.cancel();

        self.finish_monitoring().await;

        let mut upsert_failures = 0;
        for item in &output.items {
            if let Err(e) = self.listing_sink.upsert(item).await {
                warn!(locator = %item.locator, "Upsert failed: {}", e);
                upsert_failures += 1;
            }
        }

        let mut all_errors = discovery_errors.clone();
        all_errors.extend(output.errors.iter().cloned());
        self.record_errors(&all_errors).await;

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            partitions: partitions.len(),
            partitions_timed_out: discovered.timed_out,
            partitions_failed: discovered.failed,
            candidates: found,
            duplicates_skipped,
            enriched: output.items.len(),
            item_failures: output.errors.len(),
            upsert_failures,
            discovery_errors,
        };

        if output.is_total_failure() {
            warn!(%run_id, failures = report.item_failures, "Run finished without a single enriched item");
        }
        info!(
            %run_id,
            enriched = report.enriched,
            item_failures = report.item_failures,
            upsert_failures,
            "Run finished"
        );
        Ok(report)
    }

    async fn record_errors(&self, errors: &[ErrorRecord]) {
        if errors.is_empty() {
            return;
        }
        if let Err(e) = self.listing_sink.record_errors(errors).await {
            warn!(count = errors.len(), "Recording run errors failed: {}", e);
        }
    }

    /// Closes out tracking for the run and writes the stats snapshot.
    async fn finish_monitoring(&self) {
        let still_open = self.monitor.stop_all().await;
        if still_open > 0 {
            debug!(still_open, "Finalized tasks left open at run end");
        }
        self.monitor.drain().await;

        match self.monitor.write_snapshot(self.stats_sink.as_ref()).await {
            Ok(snapshot) => debug!(tasks = snapshot.tasks.len(), "Stats snapshot written"),
            Err(e) => warn!("Stats snapshot failed: {}", e),
        }
        self.monitor.reset().await;
    }
}

fn log_outcome(outcome: Result<Option<RunReport>, OrchestratorError>) {
    match outcome {
        Ok(Some(report)) => debug!(run_id = %report.run_id, "Scheduled run completed"),
        Ok(None) => {}
        Err(e) => warn!("Scheduled run ended with error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_follow_schedule_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.run_interval, Duration::from_secs(5 * 3600));
        assert_eq!(settings.min_time_between_runs, Duration::from_secs(4 * 3600 + 1800));
        assert_eq!(settings.partitions.len(), 4);
        assert!(!settings.dedupe_across_partitions);
    }

    #[test]
    fn empty_partitions_rejected() {
        use crate::test_utils::{MemorySink, MemoryStatsSink, ScriptedExtractor};

        let settings = OrchestratorSettings {
            partitions: Vec::new(),
            ..OrchestratorSettings::default()
        };
        let result = Orchestrator::new(
            settings,
            Arc::new(ScriptedExtractor::new()),
            Arc::new(MemorySink::default()),
            Arc::new(MemoryStatsSink::default()),
        );
        assert!(matches!(result, Err(OrchestratorError::InvalidSettings(_))));
    }
}
