//! # Crawling engine
//!
//! Stages of one crawl run, leaves first:
//! - [`limiter`]: admission gates bounding in-flight work per stage
//! - [`monitor`]: per-task lifecycle and resource sampling
//! - [`retry`]: bounded retries with exponential backoff
//! - [`discovery`]: per-partition pagination producing deduplicated candidates
//! - [`enrichment`]: per-candidate detail fetch under retry
//! - [`aggregation`]: fan-in of enrichment successes and failures
//! - [`orchestrator`]: run scheduling and the end-to-end pipeline

pub mod aggregation;
pub mod discovery;
pub mod enrichment;
pub mod extractor;
pub mod limiter;
pub mod monitor;
pub mod orchestrator;
pub mod retry;
pub mod scope;
pub mod sink;
pub mod tasks;

pub use aggregation::{AggregateOutput, Aggregator};
pub use discovery::{CandidateSet, DiscoveryPolicy, DiscoveryStage, PartitionOutcome};
pub use enrichment::{EnrichmentPolicy, EnrichmentStage};
pub use extractor::{DetailField, DetailPage, ExtractError, PageExtractor, ScrollSession};
pub use limiter::{ConcurrencyLimiter, LimiterError, Slot};
pub use monitor::{ProcessSampler, ResourceMonitor, ResourceSample, ResourceSampler, StatsSnapshot, TaskHandle, TaskStats};
pub use orchestrator::{Orchestrator, OrchestratorError, OrchestratorSettings, RunReport};
pub use retry::{RetryError, RetryExecutor, RetryPolicy, Retryable};
pub use scope::{Interrupted, RunScope};
pub use sink::{ListingSink, SinkError, StatsSink};
pub use tasks::{TaskId, TaskKind};
