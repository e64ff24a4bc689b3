//! # Discovery Stage
//!
//! Paginates one partition at a time through a [`ScrollSession`]:
//!
//! ```text
//! Extracting -> Scrolling -> marker changed?   yes -> Extracting
//!                                              no  -> CheckMore
//! CheckMore  -> load more present?             yes -> Extracting
//!                                              no  -> Done
//! ```
//!
//! A partition ends after `max_stable_rounds` consecutive load-more rounds
//! that rendered nothing new, when the page has no load-more affordance, or
//! at the `max_rounds` cap. Candidates are deduplicated per partition on the
//! exact `(label, locator)` pair.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::extractor::{ExtractError, PageExtractor};
use super::limiter::ConcurrencyLimiter;
use super::monitor::ResourceMonitor;
use super::scope::RunScope;
use super::tasks::TaskKind;
use crate::domain::{CandidateItem, ErrorKind, ErrorRecord, SourcePartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPolicy {
    /// Consecutive load-more rounds without new content before giving up.
    pub max_stable_rounds: u32,
    /// Hard cap on rounds per partition.
    pub max_rounds: u32,
    /// Pause after each scroll or load-more so the page can render.
    #[serde(with = "super::retry::duration_ms")]
    pub round_wait: Duration,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            max_stable_rounds: defaults::DISCOVERY_MAX_STABLE_ROUNDS,
            max_rounds: defaults::DISCOVERY_MAX_ROUNDS,
            round_wait: Duration::from_millis(defaults::DISCOVERY_ROUND_WAIT_MS),
        }
    }
}

/// Running deduplicated candidate set for one scroll session.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet {
    seen: HashSet<CandidateItem>,
    items: Vec<CandidateItem>,
}

impl CandidateSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a round's items; returns only the ones not seen before.
    /// Blank-labelled items are dropped.
    pub fn merge<I>(&mut self, batch: I) -> Vec<CandidateItem>
    where
        I: IntoIterator<Item = CandidateItem>,
    {
        let mut fresh = Vec::new();
        for item in batch {
            if !item.has_label() || self.seen.contains(&item) {
                continue;
            }
            self.seen.insert(item.clone());
            self.items.push(item.clone());
            fresh.push(item);
        }
        fresh
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn items(&self) -> &[CandidateItem] {
        &self.items
    }

    #[must_use]
    pub fn into_items(self) -> Vec<CandidateItem> {
        self.items
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.items.clear();
    }
}

/// A candidate tagged with the partition it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCandidate {
    pub partition: String,
    pub item: CandidateItem,
}

/// Result of paginating one partition.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub partition: String,
    pub items: Vec<CandidateItem>,
    pub rounds: u32,
    /// `PartitionTimeout` keeps `items`; `PartitionFailure` empties them.
    pub error: Option<ErrorRecord>,
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub candidates: Vec<PartitionCandidate>,
    pub partitions: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub failed: usize,
}

pub struct DiscoveryStage {
    extractor: Arc<dyn PageExtractor>,
    policy: DiscoveryPolicy,
    limiter: ConcurrencyLimiter,
    monitor: ResourceMonitor,
}

impl DiscoveryStage {
    #[must_use]
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        policy: DiscoveryPolicy,
        limiter: ConcurrencyLimiter,
        monitor: ResourceMonitor,
    ) -> Self {
        Self {
            extractor,
            policy,
            limiter,
            monitor,
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Fans out one task per partition under the partition limiter.
    ///
    /// Partition errors go to `errors` best-effort: a full channel drops the
    /// record instead of blocking the partition worker.
    pub async fn run(
        self: &Arc<Self>,
        partitions: &[SourcePartition],
        scope: &RunScope,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> DiscoveryReport {
        let accumulator: Arc<Mutex<Vec<PartitionCandidate>>> = Arc::default();
        let mut workers = JoinSet::new();

        for partition in partitions.iter().cloned() {
            let stage = Arc::clone(self);
            let scope = scope.clone();
            let accumulator = Arc::clone(&accumulator);
            let errors = errors.clone();
            workers.spawn(async move { stage.run_partition(partition, &scope, &accumulator, &errors).await });
        }
        drop(errors);

        let mut report = DiscoveryReport {
            partitions: partitions.len(),
            ..DiscoveryReport::default()
        };
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(None) => report.completed += 1,
                Ok(Some(ErrorKind::PartitionTimeout)) => report.timed_out += 1,
                Ok(Some(_)) => report.failed += 1,
                Err(e) => {
                    error!("Discovery worker aborted: {}", e);
                    report.failed += 1;
                }
            }
        }

        report.candidates = std::mem::take(&mut *accumulator.lock().await);
        report
    }

    async fn run_partition(
        &self,
        partition: SourcePartition,
        scope: &RunScope,
        accumulator: &Mutex<Vec<PartitionCandidate>>,
        errors: &mpsc::Sender<ErrorRecord>,
    ) -> Option<ErrorKind> {
        let label = partition.label();
        let _slot = match self.limiter.acquire_within(scope).await {
            Ok(slot) => slot,
            Err(e) => {
                warn!(partition = %label, "Partition never admitted: {}", e);
                report_best_effort(errors, ErrorRecord::partition(ErrorKind::PartitionTimeout, &label, &e));
                return Some(ErrorKind::PartitionTimeout);
            }
        };

        let handle = self.monitor.start_tracking(&label, TaskKind::Discovery).await;
        info!(partition = %label, url = %partition.url, "Discovery started");

        let outcome = self
            .discover_partition(&partition, scope, |round, fresh| {
                trace!(partition = %partition, round, fresh = fresh.len(), "round merged");
            })
            .await;

        self.monitor.record_items(&handle, outcome.items.len()).await;
        self.monitor.stop_tracking(&handle).await;

        info!(
            partition = %label,
            rounds = outcome.rounds,
            items = outcome.items.len(),
            "Discovery finished"
        );

        let kind = outcome.error.as_ref().map(|record| record.kind);
        if let Some(record) = outcome.error {
            report_best_effort(errors, record);
        }
        if !outcome.items.is_empty() {
            let mut shared = accumulator.lock().await;
            shared.extend(outcome.items.into_iter().map(|item| PartitionCandidate {
                partition: label.clone(),
                item,
            }));
        }
        kind
    }

    /// Paginates one partition to completion, invoking `on_round` with each
    /// round's newly seen candidates.
    pub async fn discover_partition<F>(
        &self,
        partition: &SourcePartition,
        scope: &RunScope,
        mut on_round: F,
    ) -> PartitionOutcome
    where
        F: FnMut(u32, &[CandidateItem]) + Send,
    {
        let label = partition.label();
        let mut set = CandidateSet::new();
        let mut rounds = 0;

        let result = self
            .paginate(partition, scope, &mut set, &mut rounds, &mut on_round)
            .await;

        let error = match result {
            Ok(()) => None,
            Err(e) if e.is_interruption() => {
                warn!(partition = %label, kept = set.len(), "Partition stopped early: {}", e);
                Some(ErrorRecord::partition(ErrorKind::PartitionTimeout, &label, &e))
            }
            Err(e) => {
                error!(partition = %label, discarded = set.len(), "Partition failed: {}", e);
                set.clear();
                Some(ErrorRecord::partition(ErrorKind::PartitionFailure, &label, &e))
            }
        };

        PartitionOutcome {
            partition: label,
            items: set.into_items(),
            rounds,
            error,
        }
    }

    async fn paginate<F>(
        &self,
        partition: &SourcePartition,
        scope: &RunScope,
        set: &mut CandidateSet,
        rounds: &mut u32,
        on_round: &mut F,
    ) -> Result<(), ExtractError>
    where
        F: FnMut(u32, &[CandidateItem]) + Send,
    {
        let mut session = scope.run(self.extractor.open_partition(partition)).await??;
        let mut marker = scope.run(session.scroll_marker()).await??;
        let mut stable_rounds = 0;
        let mut last_round = false;

        loop {
            *rounds += 1;
            let visible = scope.run(session.visible_items()).await??;
            let fresh = set.merge(visible);
            debug!(
                partition = %partition,
                round = *rounds,
                fresh = fresh.len(),
                total = set.len(),
                "Extracted round"
            );
            on_round(*rounds, &fresh);

            if last_round {
                debug!(partition = %partition, stable_rounds, "No new content after load more, stopping");
                return Ok(());
            }
            if *rounds >= self.policy.max_rounds {
                warn!(partition = %partition, rounds = *rounds, "Round cap reached");
                return Ok(());
            }

            scope.run(session.scroll()).await??;
            scope.sleep(self.policy.round_wait).await?;

            let next = scope.run(session.scroll_marker()).await??;
            if next != marker {
                marker = next;
                stable_rounds = 0;
                continue;
            }

            if !scope.run(session.load_more()).await?? {
                return Ok(());
            }
            stable_rounds += 1;
            last_round = stable_rounds >= self.policy.max_stable_rounds;
            scope.sleep(self.policy.round_wait).await?;
        }
    }
}

/// Keeps the first occurrence of each locator across partitions.
pub fn dedupe_by_locator(candidates: Vec<PartitionCandidate>) -> (Vec<PartitionCandidate>, usize) {
    let before = candidates.len();
    let mut seen = HashSet::new();
    let kept: Vec<_> = candidates
        .into_iter()
        .filter(|c| seen.insert(c.item.locator.clone()))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

fn report_best_effort(errors: &mpsc::Sender<ErrorRecord>, record: ErrorRecord) {
    if let Err(e) = errors.try_send(record) {
        debug!("Discovery error report dropped: {}", e);
    }
}
