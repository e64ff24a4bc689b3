//! # Enrichment Stage
//!
//! One worker per candidate. Each worker takes an item slot, starts resource
//! tracking, and runs the composite detail fetch under the retry executor.
//! Retries cover whole-page failures only; a field that cannot be read or
//! parsed is logged and left empty.

pub mod fields;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::discovery::PartitionCandidate;
use super::extractor::{DetailField, DetailPage, ExtractError, PageExtractor};
use super::limiter::ConcurrencyLimiter;
use super::monitor::ResourceMonitor;
use super::retry::{RetryError, RetryExecutor};
use super::scope::RunScope;
use super::tasks::TaskKind;
use crate::domain::{DetailFields, EnrichedItem, ErrorRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentPolicy {
    /// Deadline for one attempt: open, politeness wait and every field read.
    #[serde(with = "super::retry::duration_ms")]
    pub per_item_timeout: Duration,
    /// Random pause after the page opens, drawn from `[min, max]`.
    #[serde(with = "super::retry::duration_ms")]
    pub politeness_min: Duration,
    #[serde(with = "super::retry::duration_ms")]
    pub politeness_max: Duration,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        use crate::infrastructure::config::defaults;
        Self {
            per_item_timeout: Duration::from_secs(defaults::PER_ITEM_TIMEOUT_SECS),
            politeness_min: Duration::from_millis(defaults::POLITENESS_MIN_MS),
            politeness_max: Duration::from_millis(defaults::POLITENESS_MAX_MS),
        }
    }
}

impl EnrichmentPolicy {
    fn politeness_delay(&self) -> Duration {
        let min = u64::try_from(self.politeness_min.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.politeness_max.as_millis()).unwrap_or(u64::MAX);
        if max <= min {
            return self.politeness_min;
        }
        Duration::from_millis(fastrand::u64(min..=max))
    }
}

/// Sub-extractions of the composite fetch, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Area,
    Rooms,
    City,
    Description,
    Seller,
    Category,
    Amenities,
    Floor,
    BuiltYear,
    Price,
    Images,
    PostedOn,
    Neighborhood,
}

const STEPS: [Step; 13] = [
    Step::Area,
    Step::Rooms,
    Step::City,
    Step::Description,
    Step::Seller,
    Step::Category,
    Step::Amenities,
    Step::Floor,
    Step::BuiltYear,
    Step::Price,
    Step::Images,
    Step::PostedOn,
    Step::Neighborhood,
];

pub struct EnrichmentStage {
    extractor: Arc<dyn PageExtractor>,
    retry: RetryExecutor,
    limiter: ConcurrencyLimiter,
    monitor: ResourceMonitor,
    policy: EnrichmentPolicy,
}

impl EnrichmentStage {
    #[must_use]
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        retry: RetryExecutor,
        limiter: ConcurrencyLimiter,
        monitor: ResourceMonitor,
        policy: EnrichmentPolicy,
    ) -> Self {
        Self {
            extractor,
            retry,
            limiter,
            monitor,
            policy,
        }
    }

    #[must_use]
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Spawns one worker per candidate. Each worker holds its own clone of
    /// both senders, so the aggregation channels close exactly when the last
    /// worker finishes. The returned tracker is already closed.
    pub fn spawn_workers(
        self: &Arc<Self>,
        candidates: Vec<PartitionCandidate>,
        scope: &RunScope,
        items: mpsc::Sender<EnrichedItem>,
        errors: mpsc::Sender<ErrorRecord>,
    ) -> TaskTracker {
        let tracker = TaskTracker::new();
        info!(candidates = candidates.len(), capacity = self.limiter.capacity(), "Enrichment started");

        for candidate in candidates {
            let stage = Arc::clone(self);
            let scope = scope.clone();
            let items = items.clone();
            let errors = errors.clone();
            tracker.spawn(async move {
                let delivered = match stage.enrich(&candidate, &scope).await {
                    Ok(item) => items.send(item).await.is_ok(),
                    Err(record) => errors.send(record).await.is_ok(),
                };
                if !delivered {
                    warn!(locator = %candidate.item.locator, "Aggregation closed before result was delivered");
                }
            });
        }

        tracker.close();
        tracker
    }

    /// Enriches one candidate: admission, tracking, retried fetch.
    pub async fn enrich(&self, candidate: &PartitionCandidate, scope: &RunScope) -> Result<EnrichedItem, ErrorRecord> {
        let locator = candidate.item.locator.as_str();

        let _slot = self.limiter.acquire_within(scope).await.map_err(|e| {
            debug!(locator, "Item never admitted: {}", e);
            ErrorRecord::item_fetch(locator, &candidate.partition, &e, 0)
        })?;

        let handle = self.monitor.start_tracking(locator, TaskKind::Enrichment).await;

        let result = self
            .retry
            .execute(scope, |attempt| {
                let attempt_scope = scope.child(self.policy.per_item_timeout);
                trace!(locator, attempt, "Fetching detail");
                async move { self.extract_detail(locator, &attempt_scope).await }
            })
            .await;

        self.monitor.record_items(&handle, usize::from(result.is_ok())).await;
        self.monitor.stop_tracking(&handle).await;

        match result {
            Ok(fields) => {
                debug!(locator, populated = fields.populated(), "Detail extracted");
                Ok(EnrichedItem::new(&candidate.item, &candidate.partition, fields))
            }
            Err(e) => {
                warn!(locator, attempts = e.attempts(), "Enrichment failed: {}", e);
                Err(failure_record(candidate, &e))
            }
        }
    }

    /// One attempt of the composite fetch-and-extract operation.
    pub async fn extract_detail(&self, locator: &str, scope: &RunScope) -> Result<DetailFields, ExtractError> {
        let page = scope.run(self.extractor.open_detail(locator)).await??;
        scope.sleep(self.policy.politeness_delay()).await?;

        let mut fields = DetailFields::default();
        for step in STEPS {
            scope.check()?;
            match apply_step(step, page.as_ref(), scope, &mut fields).await {
                Ok(()) => {}
                Err(e) if e.is_interruption() => return Err(e),
                Err(e) => debug!(locator, ?step, "Field miss: {}", e),
            }
        }
        Ok(fields)
    }
}

fn failure_record(candidate: &PartitionCandidate, error: &RetryError<ExtractError>) -> ErrorRecord {
    let cause = error
        .last_error()
        .map_or_else(|| error.to_string(), ToString::to_string);
    ErrorRecord::item_fetch(&candidate.item.locator, &candidate.partition, cause, error.attempts())
}

async fn read_text(page: &dyn DetailPage, scope: &RunScope, field: DetailField) -> Result<String, ExtractError> {
    let text = scope.run(page.read_text(field)).await??;
    let text = text.trim();
    if text.is_empty() {
        return Err(ExtractError::FieldMissing(field));
    }
    Ok(text.to_string())
}

async fn read_all(page: &dyn DetailPage, scope: &RunScope, field: DetailField) -> Result<Vec<String>, ExtractError> {
    scope.run(page.read_all(field)).await?
}

fn parsed<T>(field: DetailField, text: &str, value: Option<T>) -> Result<T, ExtractError> {
    value.ok_or_else(|| ExtractError::Parse {
        field,
        value: text.to_string(),
    })
}

async fn apply_step(
    step: Step,
    page: &dyn DetailPage,
    scope: &RunScope,
    out: &mut DetailFields,
) -> Result<(), ExtractError> {
    match step {
        Step::Area => {
            let text = read_text(page, scope, DetailField::Area).await?;
            out.area = Some(parsed(DetailField::Area, &text, fields::parse_first_number(&text))?);
        }
        Step::Rooms => {
            let text = read_text(page, scope, DetailField::Rooms).await?;
            out.rooms = Some(parsed(DetailField::Rooms, &text, fields::parse_count(&text))?);
        }
        Step::City => {
            let text = read_text(page, scope, DetailField::Subtitle).await?;
            out.city = Some(parsed(DetailField::Subtitle, &text, fields::city_from_subtitle(&text))?);
        }
        Step::Description => {
            out.description = Some(read_text(page, scope, DetailField::Description).await?);
        }
        Step::Seller => {
            let text = read_text(page, scope, DetailField::Seller).await?;
            out.seller = Some(fields::normalize_digits(&text));
        }
        Step::Category => {
            let text = read_text(page, scope, DetailField::CategoryChip).await?;
            let (ad_type, house_type) = fields::split_category_chip(&text);
            out.ad_type = ad_type;
            out.house_type = house_type;
        }
        Step::Amenities => {
            let labels = read_all(page, scope, DetailField::Amenities).await?;
            let flags = fields::amenity_flags(&labels);
            out.has_elevator = Some(flags.elevator);
            out.has_storage = Some(flags.storage);
            out.has_parking = Some(flags.parking);
        }
        Step::Floor => {
            let text = read_text(page, scope, DetailField::Floor).await?;
            out.floor = Some(parsed(DetailField::Floor, &text, fields::parse_floor(&text))?);
        }
        Step::BuiltYear => {
            let text = read_text(page, scope, DetailField::BuiltYear).await?;
            out.built_year = Some(parsed(DetailField::BuiltYear, &text, fields::parse_count(&text))?);
        }
        Step::Price => {
            let text = read_text(page, scope, DetailField::Price).await?;
            out.price = Some(parsed(DetailField::Price, &text, fields::parse_grouped_integer(&text))?);
        }
        Step::Images => {
            out.images = fields::keep_images(read_all(page, scope, DetailField::Images).await?);
        }
        Step::PostedOn => {
            let text = read_text(page, scope, DetailField::Title).await?;
            out.posted_on = Some(parsed(DetailField::Title, &text, fields::parse_posted_on(&text))?);
        }
        Step::Neighborhood => {
            let text = read_text(page, scope, DetailField::Subtitle).await?;
            out.neighborhood = Some(parsed(
                DetailField::Subtitle,
                &text,
                fields::neighborhood_from_subtitle(&text),
            )?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateItem, ErrorKind};
    use crate::test_utils::{FixedSampler, ScriptedDetail, ScriptedExtractor};
    use crate::crawling::retry::RetryPolicy;

    fn stage(extractor: ScriptedExtractor, max_attempts: u32) -> EnrichmentStage {
        EnrichmentStage::new(
            Arc::new(extractor),
            RetryExecutor::new(RetryPolicy::new(max_attempts, Duration::from_secs(1))),
            ConcurrencyLimiter::new("items", 4),
            ResourceMonitor::new(Duration::from_secs(1), Arc::new(FixedSampler::new(1, 0.0))),
            EnrichmentPolicy {
                per_item_timeout: Duration::from_secs(20),
                politeness_min: Duration::from_millis(100),
                politeness_max: Duration::from_millis(200),
            },
        )
    }

    fn candidate(locator: &str) -> PartitionCandidate {
        PartitionCandidate {
            partition: "tehran/buy-apartment".into(),
            item: CandidateItem::new(format!("House {locator}"), locator),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fields_are_kept() {
        let detail = ScriptedDetail::new()
            .with_text(DetailField::Area, "۸۵ متر")
            .with_text(DetailField::CategoryChip, "فروش آپارتمان")
            .with_text(DetailField::Price, "not a price")
            .with_all(DetailField::Amenities, vec!["آسانسور".into()]);
        let extractor = ScriptedExtractor::new().with_detail("u1", detail);
        let stage = stage(extractor, 3);
        let scope = RunScope::new(Duration::from_secs(60));

        let item = stage.enrich(&candidate("u1"), &scope).await.unwrap();

        assert_eq!(item.fields.area, Some(85.0));
        assert_eq!(item.fields.ad_type.as_deref(), Some("فروش"));
        assert_eq!(item.fields.house_type.as_deref(), Some("آپارتمان"));
        assert_eq!(item.fields.price, None);
        assert_eq!(item.fields.has_elevator, Some(true));
        assert_eq!(item.fields.rooms, None);
        assert_eq!(item.partition, "tehran/buy-apartment");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let extractor = ScriptedExtractor::new()
            .with_detail("u1", ScriptedDetail::new().with_text(DetailField::Rooms, "۲"))
            .failing_detail_times("u1", 2);
        let stage = stage(extractor, 3);
        let scope = RunScope::new(Duration::from_secs(60));

        let item = stage.enrich(&candidate("u1"), &scope).await.unwrap();
        assert_eq!(item.fields.rooms, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_becomes_error_record() {
        let extractor = ScriptedExtractor::new().failing_detail_times("u2", u32::MAX);
        let stage = stage(extractor, 3);
        let scope = RunScope::new(Duration::from_secs(60));

        let record = stage.enrich(&candidate("u2"), &scope).await.unwrap_err();

        assert_eq!(record.kind, ErrorKind::ItemFetchFailure);
        assert_eq!(record.locator.as_deref(), Some("u2"));
        assert_eq!(record.attempts, 3);
        assert!(record.cause.contains("503"));
        assert_eq!(stage.limiter().in_use(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_retried() {
        let extractor = ScriptedExtractor::new()
            .with_detail("u1", ScriptedDetail::new().with_text(DetailField::Rooms, "3"))
            .hanging_detail_times("u1", 1);
        let stage = stage(extractor, 3);
        let scope = RunScope::new(Duration::from_secs(600));

        let item = stage.enrich(&candidate("u1"), &scope).await.unwrap();
        assert_eq!(item.fields.rooms, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn run_cancellation_is_not_retried() {
        let extractor = ScriptedExtractor::new().hanging_detail_times("u1", u32::MAX);
        let stage = stage(extractor, 3);
        let scope = RunScope::new(Duration::from_secs(5));

        let record = stage.enrich(&candidate("u1"), &scope).await.unwrap_err();
        assert_eq!(record.attempts, 1);
        assert_eq!(stage.limiter().in_use(), 0);
    }
}
