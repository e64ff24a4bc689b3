//! Infrastructure layer: configuration, logging, HTTP/HTML extraction and storage
//!
//! Concrete implementations of the seams the crawl engine is written against.

pub mod config;
pub mod html_extractor;
pub mod http_client;
pub mod listing_repository;
pub mod logging;
pub mod stats_export;

pub use config::{AppConfig, ConfigError, CrawlerConfig, ExtractorConfig, LoggingConfig, StorageConfig};
pub use html_extractor::HtmlPageExtractor;
pub use http_client::{HttpClient, HttpClientConfig};
pub use listing_repository::SqliteListingSink;
pub use logging::{init_logging, init_logging_with_config, log_system_info};
pub use stats_export::JsonStatsSink;
