//! Listing Crawler
//!
//! Periodically crawls a listings site split into source partitions
//! (locality x category): paginates each partition for candidates, enriches
//! every candidate from its detail page under bounded concurrency and retry,
//! then hands the results to a listing sink.

pub mod crawling;
pub mod domain;
pub mod infrastructure;
pub mod test_utils;

pub use crawling::{Orchestrator, OrchestratorError, OrchestratorSettings, RunReport};
pub use domain::{CandidateItem, DetailFields, EnrichedItem, ErrorKind, ErrorRecord, SourcePartition};
pub use infrastructure::AppConfig;
