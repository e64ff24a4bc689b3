//! Domain layer: pure data describing what the crawler discovers and produces.
//!
//! Nothing in here performs I/O. The crawling stages and the infrastructure
//! adapters both depend on these types.

pub mod error_record;
pub mod listing;

pub use error_record::{ErrorKind, ErrorRecord, Stage};
pub use listing::{CandidateItem, DetailFields, EnrichedItem, SourcePartition};
