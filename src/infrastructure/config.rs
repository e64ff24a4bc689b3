//! Configuration infrastructure
//!
//! Layered the usual way: built-in defaults, then an optional TOML/JSON file,
//! then `CRAWLER__`-prefixed environment variables (`__` separates nesting,
//! e.g. `CRAWLER__CRAWLER__MAX_ITEM_CONCURRENCY=16`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::crawling::discovery::DiscoveryPolicy;
use crate::crawling::enrichment::EnrichmentPolicy;
use crate::crawling::extractor::DetailField;
use crate::crawling::orchestrator::OrchestratorSettings;
use crate::crawling::retry::RetryPolicy;
use crate::domain::SourcePartition;

pub const APP_DIR_NAME: &str = "listing-crawler";
pub const ENV_PREFIX: &str = "CRAWLER";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {source}")]
    Load {
        #[from]
        source: config::ConfigError,
    },

    #[error("Configuration validation failed: {message}")]
    Validation { message: String },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub crawler: CrawlerConfig,
    pub extractor: ExtractorConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Scheduling, concurrency and retry settings of the crawl engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub run_interval_secs: u64,
    pub min_time_between_runs_secs: u64,
    /// Deadline for one whole run
    pub page_timeout_secs: u64,
    /// Deadline for one detail fetch attempt
    pub per_item_timeout_secs: u64,
    pub max_partition_concurrency: usize,
    pub max_item_concurrency: usize,
    pub base_url: String,
    pub localities: Vec<String>,
    pub categories: Vec<String>,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_stable_rounds: u32,
    pub max_rounds: u32,
    pub round_wait_ms: u64,
    pub politeness_min_ms: u64,
    pub politeness_max_ms: u64,
    pub sample_interval_ms: u64,
    pub dedupe_across_partitions: bool,
    pub result_buffer: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: defaults::RUN_INTERVAL_SECS,
            min_time_between_runs_secs: defaults::MIN_TIME_BETWEEN_RUNS_SECS,
            page_timeout_secs: defaults::PAGE_TIMEOUT_SECS,
            per_item_timeout_secs: defaults::PER_ITEM_TIMEOUT_SECS,
            max_partition_concurrency: defaults::MAX_PARTITION_CONCURRENCY,
            max_item_concurrency: defaults::MAX_ITEM_CONCURRENCY,
            base_url: defaults::BASE_URL.to_string(),
            localities: defaults::localities(),
            categories: defaults::categories(),
            retry_max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            max_stable_rounds: defaults::DISCOVERY_MAX_STABLE_ROUNDS,
            max_rounds: defaults::DISCOVERY_MAX_ROUNDS,
            round_wait_ms: defaults::DISCOVERY_ROUND_WAIT_MS,
            politeness_min_ms: defaults::POLITENESS_MIN_MS,
            politeness_max_ms: defaults::POLITENESS_MAX_MS,
            sample_interval_ms: defaults::SAMPLE_INTERVAL_MS,
            dedupe_across_partitions: false,
            result_buffer: defaults::RESULT_BUFFER,
        }
    }
}

impl CrawlerConfig {
    #[must_use]
    pub fn partitions(&self) -> Vec<SourcePartition> {
        SourcePartition::expand(&self.base_url, &self.localities, &self.categories)
    }

    #[must_use]
    pub fn to_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            run_interval: Duration::from_secs(self.run_interval_secs),
            min_time_between_runs: Duration::from_secs(self.min_time_between_runs_secs),
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            max_partition_concurrency: self.max_partition_concurrency,
            max_item_concurrency: self.max_item_concurrency,
            partitions: self.partitions(),
            retry: RetryPolicy::new(self.retry_max_attempts, Duration::from_millis(self.retry_base_delay_ms)),
            discovery: DiscoveryPolicy {
                max_stable_rounds: self.max_stable_rounds,
                max_rounds: self.max_rounds,
                round_wait: Duration::from_millis(self.round_wait_ms),
            },
            enrichment: EnrichmentPolicy {
                per_item_timeout: Duration::from_secs(self.per_item_timeout_secs),
                politeness_min: Duration::from_millis(self.politeness_min_ms),
                politeness_max: Duration::from_millis(self.politeness_max_ms),
            },
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            dedupe_across_partitions: self.dedupe_across_partitions,
            result_buffer: self.result_buffer,
        }
    }
}

/// HTTP client and CSS selectors of the HTML page extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub user_agent: String,
    pub request_timeout_secs: u64,
    pub max_requests_per_second: u32,
    /// One result card on a partition page
    pub card_selector: String,
    pub card_title_selector: String,
    pub card_link_selector: String,
    /// Link to the next batch of results ("load more")
    pub next_page_selector: String,
    pub fields: FieldSelectors,
    pub labelled_rows: LabelledRows,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("{APP_DIR_NAME}/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            max_requests_per_second: defaults::MAX_REQUESTS_PER_SECOND,
            card_selector: ".kt-post-card".into(),
            card_title_selector: ".kt-post-card__title".into(),
            card_link_selector: "a".into(),
            next_page_selector: "a.post-list__load-more-btn, a[rel=next]".into(),
            fields: FieldSelectors::default(),
            labelled_rows: LabelledRows::default(),
        }
    }
}

/// Candidate selectors per detail field, tried in order until one yields text
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelectors {
    pub area: Vec<String>,
    pub rooms: Vec<String>,
    pub subtitle: Vec<String>,
    pub description: Vec<String>,
    pub seller: Vec<String>,
    pub category_chip: Vec<String>,
    pub amenities: Vec<String>,
    pub floor: Vec<String>,
    pub built_year: Vec<String>,
    pub price: Vec<String>,
    pub images: Vec<String>,
    pub title: Vec<String>,
}

fn selectors(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

impl Default for FieldSelectors {
    fn default() -> Self {
        Self {
            area: selectors(&[
                ".kt-group-row__data-row .kt-group-row-item__value",
                ".kt-unexpandable-row__value",
            ]),
            rooms: selectors(&[".kt-group-row__data-row td:nth-child(3)"]),
            subtitle: selectors(&[".kt-page-title__subtitle"]),
            description: selectors(&[".kt-description-row__text.kt-description-row__text--primary"]),
            seller: selectors(&[".copy-row a.kt-unexpandable-row__action"]),
            category_chip: selectors(&[".post-page__section--padded .kt-chip span"]),
            amenities: selectors(&[".kt-group-row__data-row .kt-body.kt-body--stable"]),
            floor: Vec::new(),
            built_year: selectors(&["table.kt-group-row tbody tr td:nth-child(2)"]),
            price: Vec::new(),
            images: selectors(&["picture img"]),
            title: selectors(&["title"]),
        }
    }
}

impl FieldSelectors {
    #[must_use]
    pub fn for_field(&self, field: DetailField) -> &[String] {
        match field {
            DetailField::Area => &self.area,
            DetailField::Rooms => &self.rooms,
            DetailField::Subtitle => &self.subtitle,
            DetailField::Description => &self.description,
            DetailField::Seller => &self.seller,
            DetailField::CategoryChip => &self.category_chip,
            DetailField::Amenities => &self.amenities,
            DetailField::Floor => &self.floor,
            DetailField::BuiltYear => &self.built_year,
            DetailField::Price => &self.price,
            DetailField::Images => &self.images,
            DetailField::Title => &self.title,
        }
    }
}

/// Key/value rows located by their title text rather than position
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelledRows {
    pub row_selector: String,
    pub title_selector: String,
    pub value_selector: String,
    pub floor_label: String,
    pub price_label: String,
}

impl Default for LabelledRows {
    fn default() -> Self {
        Self {
            row_selector: ".kt-base-row".into(),
            title_selector: ".kt-base-row__title, .kt-unexpandable-row__title-box p".into(),
            value_selector: ".kt-unexpandable-row__value".into(),
            floor_label: "طبقه".into(),
            price_label: "قیمت کل".into(),
        }
    }
}

impl LabelledRows {
    #[must_use]
    pub fn label_for(&self, field: DetailField) -> Option<&str> {
        match field {
            DetailField::Floor => Some(&self.floor_label),
            DetailField::Price => Some(&self.price_label),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection string, e.g. `sqlite://listings.db`
    pub database_url: String,
    /// Where stats snapshots are written
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = app_data_dir();
        Self {
            database_url: format!("sqlite://{}", data_dir.join("listings.db").display()),
            output_dir: data_dir.join(defaults::OUTPUT_DIR),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level filter, e.g. "info" or "debug"
    pub level: String,
    pub json_format: bool,
    pub console_output: bool,
    pub file_output: bool,
    pub log_dir: PathBuf,
    pub file_prefix: String,
    /// "daily", "hourly" or "never"
    pub rotation: String,
    pub max_files: u32,
    pub auto_cleanup_logs: bool,
    /// Extra per-target directives, e.g. `{"listing_crawler::crawling::discovery" = "trace"}`
    pub module_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_format: false,
            console_output: true,
            file_output: true,
            log_dir: app_data_dir().join("logs"),
            file_prefix: APP_DIR_NAME.into(),
            rotation: "daily".into(),
            max_files: 7,
            auto_cleanup_logs: true,
            module_filters: HashMap::new(),
        }
    }
}

/// Local data directory for the database, logs and snapshots.
#[must_use]
pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Default config file location, `<config dir>/listing-crawler/config.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join("config.toml"))
}

impl AppConfig {
    /// Defaults, then `path` (required when given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                info!("Loading configuration from {:?}", path);
                builder = builder.add_source(config::File::from(path).required(true));
            }
            None => {
                if let Some(path) = default_config_path() {
                    builder = builder.add_source(config::File::from(path).required(false));
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("crawler.localities")
                    .with_list_parse_key("crawler.categories"),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let crawler = &self.crawler;

        if crawler.max_partition_concurrency == 0 || crawler.max_item_concurrency == 0 {
            return Err(ConfigError::invalid("concurrency limits must be greater than 0"));
        }
        if crawler.retry_max_attempts == 0 {
            return Err(ConfigError::invalid("retry_max_attempts must be greater than 0"));
        }
        for (name, value) in [
            ("run_interval_secs", crawler.run_interval_secs),
            ("page_timeout_secs", crawler.page_timeout_secs),
            ("per_item_timeout_secs", crawler.per_item_timeout_secs),
            ("sample_interval_ms", crawler.sample_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{name} must be greater than 0")));
            }
        }
        if crawler.max_stable_rounds == 0 || crawler.max_rounds == 0 {
            return Err(ConfigError::invalid("discovery round limits must be greater than 0"));
        }
        if crawler.localities.is_empty() || crawler.categories.is_empty() {
            return Err(ConfigError::invalid("at least one locality and one category are required"));
        }
        if crawler.politeness_min_ms > crawler.politeness_max_ms {
            return Err(ConfigError::invalid("politeness_min_ms cannot exceed politeness_max_ms"));
        }
        if url::Url::parse(&crawler.base_url).is_err() {
            return Err(ConfigError::invalid(format!("base_url is not a valid URL: {}", crawler.base_url)));
        }
        if self.extractor.max_requests_per_second == 0 {
            return Err(ConfigError::invalid("max_requests_per_second must be greater than 0"));
        }
        Ok(())
    }
}

/// Default values shared by config structs and runtime policies
pub mod defaults {
    /// Ticker period: 5 hours
    pub const RUN_INTERVAL_SECS: u64 = 5 * 3600;

    /// 0.9 of the run interval, so a slightly early tick still runs
    pub const MIN_TIME_BETWEEN_RUNS_SECS: u64 = RUN_INTERVAL_SECS * 9 / 10;

    pub const PAGE_TIMEOUT_SECS: u64 = 30 * 60;
    pub const PER_ITEM_TIMEOUT_SECS: u64 = 20 * 60;

    pub const MAX_PARTITION_CONCURRENCY: usize = 4;
    pub const MAX_ITEM_CONCURRENCY: usize = 8;

    pub const RETRY_MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY_MS: u64 = 1000;

    pub const DISCOVERY_MAX_STABLE_ROUNDS: u32 = 3;
    pub const DISCOVERY_MAX_ROUNDS: u32 = 200;
    pub const DISCOVERY_ROUND_WAIT_MS: u64 = 1000;

    pub const POLITENESS_MIN_MS: u64 = 1000;
    pub const POLITENESS_MAX_MS: u64 = 2000;

    /// One resource sample per second
    pub const SAMPLE_INTERVAL_MS: u64 = 1000;

    pub const RESULT_BUFFER: usize = 10_000;

    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const MAX_REQUESTS_PER_SECOND: u32 = 4;

    pub const BASE_URL: &str = "https://divar.ir/s/";
    pub const OUTPUT_DIR: &str = "crawler_output";

    #[must_use]
    pub fn localities() -> Vec<String> {
        vec!["tehran".to_string()]
    }

    #[must_use]
    pub fn categories() -> Vec<String> {
        ["buy-apartment", "buy-villa", "rent-apartment", "rent-villa"]
            .iter()
            .map(ToString::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.crawler.partitions().len(), 4);
        assert_eq!(config.crawler.min_time_between_runs_secs, 16_200);
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = AppConfig::default();
        config.crawler.retry_max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[crawler]\nmax_item_concurrency = 16\nlocalities = [\"karaj\", \"tehran\"]\n\n[logging]\nlevel = \"debug\""
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.crawler.max_item_concurrency, 16);
        assert_eq!(config.crawler.partitions().len(), 8);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.crawler.retry_max_attempts, 3);
    }

    #[test]
    fn bundled_config_matches_defaults() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.crawler.run_interval_secs, defaults::RUN_INTERVAL_SECS);
        assert_eq!(config.crawler.categories, defaults::categories());
        assert_eq!(config.extractor.labelled_rows.price_label, "قیمت کل");
        assert!(!config.extractor.fields.area.is_empty());
    }

    #[test]
    fn settings_carry_durations() {
        let settings = CrawlerConfig::default().to_settings();
        assert_eq!(settings.page_timeout, Duration::from_secs(1800));
        assert_eq!(settings.enrichment.per_item_timeout, Duration::from_secs(1200));
        assert_eq!(settings.retry.base_delay, Duration::from_secs(1));
    }
}
