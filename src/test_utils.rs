//! Test utilities
//!
//! Scripted and in-memory collaborators so the crawl pipeline can be driven
//! deterministically without a network, a browser or a database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::crawling::extractor::{DetailField, DetailPage, ExtractError, PageExtractor, ScrollSession};
use crate::crawling::monitor::{ResourceSample, ResourceSampler, StatsSnapshot};
use crate::crawling::sink::{ListingSink, SinkError, StatsSink};
use crate::domain::{CandidateItem, EnrichedItem, ErrorRecord, SourcePartition};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sampler returning the same reading every time.
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler {
    sample: ResourceSample,
}

impl FixedSampler {
    #[must_use]
    pub fn new(memory_kb: u64, cpu_percent: f32) -> Self {
        Self {
            sample: ResourceSample { memory_kb, cpu_percent },
        }
    }
}

impl ResourceSampler for FixedSampler {
    fn sample(&self) -> ResourceSample {
        self.sample
    }
}

/// A detail page answering from fixed values. Unknown fields are missing.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetail {
    texts: HashMap<DetailField, String>,
    lists: HashMap<DetailField, Vec<String>>,
}

impl ScriptedDetail {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_text(mut self, field: DetailField, text: impl Into<String>) -> Self {
        self.texts.insert(field, text.into());
        self
    }

    #[must_use]
    pub fn with_all(mut self, field: DetailField, values: Vec<String>) -> Self {
        self.lists.insert(field, values);
        self
    }
}

#[async_trait]
impl DetailPage for ScriptedDetail {
    async fn read_text(&self, field: DetailField) -> Result<String, ExtractError> {
        self.texts.get(&field).cloned().ok_or(ExtractError::FieldMissing(field))
    }

    async fn read_all(&self, field: DetailField) -> Result<Vec<String>, ExtractError> {
        self.lists.get(&field).cloned().ok_or(ExtractError::FieldMissing(field))
    }
}

struct ScriptedSession {
    rounds: Vec<Vec<CandidateItem>>,
    shown: usize,
    endless_load_more: bool,
    scroll_delay: Duration,
}

#[async_trait]
impl ScrollSession for ScriptedSession {
    async fn scroll_marker(&mut self) -> Result<u64, ExtractError> {
        Ok(self.shown as u64)
    }

    async fn visible_items(&mut self) -> Result<Vec<CandidateItem>, ExtractError> {
        Ok(self.rounds[..self.shown].concat())
    }

    async fn scroll(&mut self) -> Result<(), ExtractError> {
        if !self.scroll_delay.is_zero() {
            tokio::time::sleep(self.scroll_delay).await;
        }
        if self.shown < self.rounds.len() {
            self.shown += 1;
        }
        Ok(())
    }

    async fn load_more(&mut self) -> Result<bool, ExtractError> {
        Ok(self.endless_load_more)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Page extractor driven by a script.
///
/// Partitions reveal one scripted round per scroll and then stop changing.
/// Detail pages can be told to fail (HTTP 503) or hang a number of times
/// before answering.
#[derive(Default)]
pub struct ScriptedExtractor {
    partitions: HashMap<String, Vec<Vec<CandidateItem>>>,
    failing_partitions: HashSet<String>,
    endless_load_more: HashSet<String>,
    scroll_delay: Duration,
    details: HashMap<String, ScriptedDetail>,
    detail_delay: Duration,
    failures_left: Mutex<HashMap<String, u32>>,
    hangs_left: Mutex<HashMap<String, u32>>,
    detail_calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedExtractor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `label` is the partition label, e.g. "tehran/buy-villa".
    #[must_use]
    pub fn with_partition(mut self, label: &str, rounds: Vec<Vec<CandidateItem>>) -> Self {
        self.partitions.insert(label.to_string(), rounds);
        self
    }

    #[must_use]
    pub fn with_failing_partition(mut self, label: &str) -> Self {
        self.failing_partitions.insert(label.to_string());
        self
    }

    /// The partition always reports a load-more affordance.
    #[must_use]
    pub fn with_endless_load_more(mut self, label: &str) -> Self {
        self.endless_load_more.insert(label.to_string());
        self
    }

    #[must_use]
    pub fn with_scroll_delay(mut self, delay: Duration) -> Self {
        self.scroll_delay = delay;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, locator: &str, detail: ScriptedDetail) -> Self {
        self.details.insert(locator.to_string(), detail);
        self
    }

    /// Each `open_detail` sleeps this long before answering.
    #[must_use]
    pub fn with_detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    #[must_use]
    pub fn failing_detail_times(self, locator: &str, times: u32) -> Self {
        locked(&self.failures_left).insert(locator.to_string(), times);
        self
    }

    #[must_use]
    pub fn hanging_detail_times(self, locator: &str, times: u32) -> Self {
        locked(&self.hangs_left).insert(locator.to_string(), times);
        self
    }

    /// How many times `open_detail` was called for `locator`.
    #[must_use]
    pub fn detail_calls(&self, locator: &str) -> u32 {
        locked(&self.detail_calls).get(locator).copied().unwrap_or(0)
    }

    /// Highest number of simultaneous `open_detail` calls.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn take_one(counter: &Mutex<HashMap<String, u32>>, locator: &str) -> bool {
        let mut map = locked(counter);
        match map.get_mut(locator) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl PageExtractor for ScriptedExtractor {
    async fn open_partition(&self, partition: &SourcePartition) -> Result<Box<dyn ScrollSession>, ExtractError> {
        let label = partition.label();
        if self.failing_partitions.contains(&label) {
            return Err(ExtractError::navigation(&partition.url, "connection refused"));
        }
        let rounds = self.partitions.get(&label).cloned().unwrap_or_default();
        Ok(Box::new(ScriptedSession {
            shown: rounds.len().min(1),
            rounds,
            endless_load_more: self.endless_load_more.contains(&label),
            scroll_delay: self.scroll_delay,
        }))
    }

    async fn open_detail(&self, locator: &str) -> Result<Box<dyn DetailPage>, ExtractError> {
        *locked(&self.detail_calls).entry(locator.to_string()).or_insert(0) += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.detail_delay.is_zero() {
            tokio::time::sleep(self.detail_delay).await;
        }
        if Self::take_one(&self.hangs_left, locator) {
            std::future::pending::<()>().await;
        }
        if Self::take_one(&self.failures_left, locator) {
            return Err(ExtractError::Http {
                status: 503,
                url: locator.to_string(),
            });
        }
        Ok(Box::new(self.details.get(locator).cloned().unwrap_or_default()))
    }
}

/// Listing sink keeping everything in memory, keyed by locator.
#[derive(Default)]
pub struct MemorySink {
    items: tokio::sync::Mutex<HashMap<String, EnrichedItem>>,
    errors: tokio::sync::Mutex<Vec<ErrorRecord>>,
    upserts: AtomicUsize,
}

impl MemorySink {
    pub async fn items(&self) -> Vec<EnrichedItem> {
        self.items.lock().await.values().cloned().collect()
    }

    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.lock().await.clone()
    }

    #[must_use]
    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ListingSink for MemorySink {
    async fn upsert(&self, item: &EnrichedItem) -> Result<(), SinkError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.items.lock().await.insert(item.locator.clone(), item.clone());
        Ok(())
    }

    async fn record_errors(&self, errors: &[ErrorRecord]) -> Result<(), SinkError> {
        self.errors.lock().await.extend_from_slice(errors);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStatsSink {
    snapshots: tokio::sync::Mutex<Vec<StatsSnapshot>>,
}

impl MemoryStatsSink {
    pub async fn snapshots(&self) -> Vec<StatsSnapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl StatsSink for MemoryStatsSink {
    async fn write(&self, snapshot: &StatsSnapshot) -> Result<(), SinkError> {
        self.snapshots.lock().await.push(snapshot.clone());
        Ok(())
    }
}
