//! SQLite listing store
//!
//! One row per locator in `listings` (re-crawls update in place) and an
//! append-only `crawl_errors` log.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{debug, info};

use crate::crawling::sink::{ListingSink, SinkError};
use crate::domain::{EnrichedItem, ErrorRecord};

const CREATE_LISTINGS: &str = r"
    CREATE TABLE IF NOT EXISTS listings (
        locator TEXT PRIMARY KEY,
        label TEXT NOT NULL,
        partition TEXT NOT NULL,
        area REAL,
        rooms INTEGER,
        city TEXT,
        neighborhood TEXT,
        description TEXT,
        seller TEXT,
        ad_type TEXT,
        house_type TEXT,
        floor INTEGER,
        built_year INTEGER,
        price INTEGER,
        images TEXT NOT NULL DEFAULT '[]',
        posted_on TEXT,
        has_elevator BOOLEAN,
        has_storage BOOLEAN,
        has_parking BOOLEAN,
        enriched_at DATETIME NOT NULL,
        first_seen_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
";

const CREATE_ERRORS: &str = r"
    CREATE TABLE IF NOT EXISTS crawl_errors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stage TEXT NOT NULL,
        kind TEXT NOT NULL,
        locator TEXT,
        partition TEXT,
        cause TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        occurred_at DATETIME NOT NULL
    )
";

const CREATE_INDEXES: &str = r"
    CREATE INDEX IF NOT EXISTS idx_listings_partition ON listings (partition);
    CREATE INDEX IF NOT EXISTS idx_crawl_errors_kind ON crawl_errors (kind);
";

const UPSERT_LISTING: &str = r"
    INSERT INTO listings (
        locator, label, partition, area, rooms, city, neighborhood, description,
        seller, ad_type, house_type, floor, built_year, price, images, posted_on,
        has_elevator, has_storage, has_parking, enriched_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(locator) DO UPDATE SET
        label = excluded.label,
        partition = excluded.partition,
        area = excluded.area,
        rooms = excluded.rooms,
        city = excluded.city,
        neighborhood = excluded.neighborhood,
        description = excluded.description,
        seller = excluded.seller,
        ad_type = excluded.ad_type,
        house_type = excluded.house_type,
        floor = excluded.floor,
        built_year = excluded.built_year,
        price = excluded.price,
        images = excluded.images,
        posted_on = excluded.posted_on,
        has_elevator = excluded.has_elevator,
        has_storage = excluded.has_storage,
        has_parking = excluded.has_parking,
        enriched_at = excluded.enriched_at,
        updated_at = CURRENT_TIMESTAMP
";

/// A listing row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredListing {
    pub locator: String,
    pub label: String,
    pub partition: String,
    pub city: Option<String>,
    pub price: Option<i64>,
    pub floor: Option<i64>,
    pub images: String,
    pub posted_on: Option<NaiveDate>,
    pub enriched_at: DateTime<Utc>,
}

impl From<sqlx::Error> for SinkError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub struct SqliteListingSink {
    pool: SqlitePool,
}

fn database_file(database_url: &str) -> Option<&str> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    (!path.is_empty() && !path.starts_with(":memory:")).then_some(path)
}

impl SqliteListingSink {
    /// Open (creating if needed) the database and ensure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let file = database_file(database_url);
        if let Some(parent) = file.and_then(|path| Path::new(path).parent()) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database exists per connection
        let max_connections = if file.is_some() { 5 } else { 1 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let sink = Self { pool };
        sink.migrate().await?;
        info!("Listing store ready at {}", database_url);
        Ok(sink)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_LISTINGS).execute(&self.pool).await?;
        sqlx::query(CREATE_ERRORS).execute(&self.pool).await?;
        sqlx::raw_sql(CREATE_INDEXES).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn count_listings(&self) -> Result<i64, SinkError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM listings").fetch_one(&self.pool).await?)
    }

    pub async fn count_errors(&self) -> Result<i64, SinkError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM crawl_errors").fetch_one(&self.pool).await?)
    }

    pub async fn find(&self, locator: &str) -> Result<Option<StoredListing>, SinkError> {
        Ok(sqlx::query_as::<_, StoredListing>(
            "SELECT locator, label, partition, city, price, floor, images, posted_on, enriched_at \
             FROM listings WHERE locator = ?",
        )
        .bind(locator)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[async_trait]
impl ListingSink for SqliteListingSink {
    async fn upsert(&self, item: &EnrichedItem) -> Result<(), SinkError> {
        let fields = &item.fields;
        let images = serde_json::to_string(&fields.images)?;
        let price = fields.price.map(|price| i64::try_from(price).unwrap_or(i64::MAX));

        sqlx::query(UPSERT_LISTING)
            .bind(&item.locator)
            .bind(&item.label)
            .bind(&item.partition)
            .bind(fields.area)
            .bind(fields.rooms)
            .bind(&fields.city)
            .bind(&fields.neighborhood)
            .bind(&fields.description)
            .bind(&fields.seller)
            .bind(&fields.ad_type)
            .bind(&fields.house_type)
            .bind(fields.floor)
            .bind(fields.built_year)
            .bind(price)
            .bind(images)
            .bind(fields.posted_on)
            .bind(fields.has_elevator)
            .bind(fields.has_storage)
            .bind(fields.has_parking)
            .bind(item.enriched_at)
            .execute(&self.pool)
            .await?;

        debug!(locator = %item.locator, "Listing upserted");
        Ok(())
    }

    async fn record_errors(&self, errors: &[ErrorRecord]) -> Result<(), SinkError> {
        if errors.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in errors {
            sqlx::query(
                "INSERT INTO crawl_errors (stage, kind, locator, partition, cause, attempts, occurred_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.stage.to_string())
            .bind(record.kind.to_string())
            .bind(&record.locator)
            .bind(&record.partition)
            .bind(&record.cause)
            .bind(record.attempts)
            .bind(record.occurred_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = errors.len(), "Crawl errors recorded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateItem, DetailFields, ErrorKind};

    async fn memory_sink() -> SqliteListingSink {
        SqliteListingSink::connect("sqlite::memory:").await.unwrap()
    }

    fn item(locator: &str, price: Option<u64>) -> EnrichedItem {
        let candidate = CandidateItem::new("Villa with garden", locator);
        let fields = DetailFields {
            city: Some("تهران".into()),
            price,
            floor: Some(-1),
            images: vec!["https://img.example/1.jpg".into()],
            ..DetailFields::default()
        };
        EnrichedItem::new(&candidate, "tehran/buy-villa", fields)
    }

    #[tokio::test]
    async fn upsert_updates_existing_locator() {
        let sink = memory_sink().await;
        sink.upsert(&item("https://divar.ir/v/a", Some(100))).await.unwrap();
        sink.upsert(&item("https://divar.ir/v/a", Some(250))).await.unwrap();
        sink.upsert(&item("https://divar.ir/v/b", None)).await.unwrap();

        assert_eq!(sink.count_listings().await.unwrap(), 2);
        let stored = sink.find("https://divar.ir/v/a").await.unwrap().unwrap();
        assert_eq!(stored.price, Some(250));
        assert_eq!(stored.floor, Some(-1));
        assert_eq!(stored.city.as_deref(), Some("تهران"));
        assert_eq!(stored.images, r#"["https://img.example/1.jpg"]"#);
    }

    #[tokio::test]
    async fn errors_are_appended() {
        let sink = memory_sink().await;
        let errors = vec![
            ErrorRecord::item_fetch("u1", "tehran/buy-villa", "HTTP 503", 3),
            ErrorRecord::partition(ErrorKind::PartitionTimeout, "tehran/rent-villa", "deadline exceeded"),
        ];
        sink.record_errors(&errors).await.unwrap();
        sink.record_errors(&[]).await.unwrap();
        assert_eq!(sink.count_errors().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("listings.db");
        let url = format!("sqlite://{}", path.display());

        let sink = SqliteListingSink::connect(&url).await.unwrap();
        sink.upsert(&item("u1", Some(1))).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn memory_urls_have_no_file() {
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file("sqlite://data/listings.db"), Some("data/listings.db"));
    }
}
