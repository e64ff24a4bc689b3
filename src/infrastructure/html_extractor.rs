//! Static-HTML implementation of the page extractor seam
//!
//! A partition page is fetched over HTTP and its result cards are parsed with
//! CSS selectors. "Load more" follows the next-page link; the fetched batch is
//! appended to the rendered cards on the following scroll, so the card count
//! serves as the scroll marker.
//!
//! `scraper::Html` is not `Send`, so documents are parsed and dropped inside
//! synchronous helpers and never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::config::ExtractorConfig;
use super::http_client::{HttpClient, HttpClientConfig};
use crate::crawling::extractor::{DetailField, DetailPage, ExtractError, PageExtractor, ScrollSession};
use crate::domain::{CandidateItem, SourcePartition};

const ALL_FIELDS: [DetailField; 12] = [
    DetailField::Area,
    DetailField::Rooms,
    DetailField::Subtitle,
    DetailField::Description,
    DetailField::Seller,
    DetailField::CategoryChip,
    DetailField::Amenities,
    DetailField::Floor,
    DetailField::BuiltYear,
    DetailField::Price,
    DetailField::Images,
    DetailField::Title,
];

/// Image URLs may sit in any of these attributes (lazy loading).
const IMAGE_ATTRIBUTES: [&str; 3] = ["src", "data-src", "data-lazy-src"];

struct LabelledRowSelectors {
    row: Selector,
    title: Selector,
    value: Selector,
    labels: HashMap<DetailField, String>,
}

struct CompiledSelectors {
    card: Selector,
    card_title: Selector,
    card_link: Selector,
    next_page: Selector,
    fields: HashMap<DetailField, Vec<Selector>>,
    labelled: LabelledRowSelectors,
}

fn compile(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("Invalid selector '{}': {}", selector, e))
}

/// Compile a fallback list, skipping (and logging) entries that do not parse.
fn compile_all(selectors: &[String]) -> Vec<Selector> {
    selectors
        .iter()
        .filter_map(|raw| match Selector::parse(raw) {
            Ok(selector) => Some(selector),
            Err(e) => {
                warn!("Failed to compile selector '{}': {}", raw, e);
                None
            }
        })
        .collect()
}

impl CompiledSelectors {
    fn new(config: &ExtractorConfig) -> Result<Self> {
        let fields = ALL_FIELDS
            .iter()
            .map(|field| (*field, compile_all(config.fields.for_field(*field))))
            .collect();

        let rows = &config.labelled_rows;
        let labels = ALL_FIELDS
            .iter()
            .filter_map(|field| rows.label_for(*field).map(|label| (*field, label.to_string())))
            .collect();

        Ok(Self {
            card: compile(&config.card_selector)?,
            card_title: compile(&config.card_title_selector)?,
            card_link: compile(&config.card_link_selector)?,
            next_page: compile(&config.next_page_selector)?,
            fields,
            labelled: LabelledRowSelectors {
                row: compile(&rows.row_selector)?,
                title: compile(&rows.title_selector)?,
                value: compile(&rows.value_selector)?,
                labels,
            },
        })
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    base.join(href.trim()).ok().map(String::from)
}

/// One fetched batch of result cards.
#[derive(Debug, Default)]
struct ListingPage {
    cards: Vec<CandidateItem>,
    next: Option<String>,
}

fn parse_listing(html: &str, selectors: &CompiledSelectors, base: &Url) -> ListingPage {
    let document = Html::parse_document(html);

    let cards = document
        .select(&selectors.card)
        .filter_map(|card| {
            let href = if card.value().name() == "a" {
                card.value().attr("href")
            } else {
                card.select(&selectors.card_link).find_map(|link| link.value().attr("href"))
            }?;
            let label = card
                .select(&selectors.card_title)
                .next()
                .map_or_else(|| element_text(&card), |title| element_text(&title));
            Some(CandidateItem::new(label, resolve(base, href)?))
        })
        .collect();

    let next = document
        .select(&selectors.next_page)
        .find_map(|link| link.value().attr("href"))
        .and_then(|href| resolve(base, href));

    ListingPage { cards, next }
}

fn parse_detail(html: &str, selectors: &CompiledSelectors) -> HashMap<DetailField, Vec<String>> {
    let document = Html::parse_document(html);
    let mut values: HashMap<DetailField, Vec<String>> = HashMap::new();

    for row in document.select(&selectors.labelled.row) {
        let Some(title) = row.select(&selectors.labelled.title).next().map(|t| element_text(&t)) else {
            continue;
        };
        let Some(value) = row.select(&selectors.labelled.value).next().map(|v| element_text(&v)) else {
            continue;
        };
        for (field, label) in &selectors.labelled.labels {
            if title.contains(label.as_str()) && !value.is_empty() {
                values.entry(*field).or_default().push(value.clone());
            }
        }
    }

    for (field, candidates) in &selectors.fields {
        if values.contains_key(field) {
            continue;
        }
        for selector in candidates {
            let found: Vec<String> = document
                .select(selector)
                .filter_map(|element| {
                    if *field == DetailField::Images {
                        IMAGE_ATTRIBUTES
                            .iter()
                            .find_map(|attr| element.value().attr(attr))
                            .map(str::to_string)
                    } else {
                        Some(element_text(&element))
                    }
                })
                .filter(|value| !value.trim().is_empty())
                .collect();
            if !found.is_empty() {
                values.insert(*field, found);
                break;
            }
        }
    }

    values
}

/// [`PageExtractor`] over plain HTTP and CSS selectors.
#[derive(Clone)]
pub struct HtmlPageExtractor {
    client: Arc<HttpClient>,
    selectors: Arc<CompiledSelectors>,
    shutdown: CancellationToken,
}

impl HtmlPageExtractor {
    pub fn new(config: &ExtractorConfig, shutdown: CancellationToken) -> Result<Self> {
        let client = HttpClient::new(HttpClientConfig::from(config))?;
        Ok(Self {
            client: Arc::new(client),
            selectors: Arc::new(CompiledSelectors::new(config)?),
            shutdown,
        })
    }

    async fn fetch(&self, url: &str) -> Result<String, ExtractError> {
        self.client.get_text(url, &self.shutdown).await
    }
}

fn parse_url(url: &str) -> Result<Url, ExtractError> {
    Url::parse(url).map_err(|e| ExtractError::navigation(url, e))
}

#[async_trait]
impl PageExtractor for HtmlPageExtractor {
    async fn open_partition(&self, partition: &SourcePartition) -> Result<Box<dyn ScrollSession>, ExtractError> {
        let base = parse_url(&partition.url)?;
        let html = self.fetch(&partition.url).await?;
        let page = parse_listing(&html, &self.selectors, &base);
        debug!(partition = %partition, cards = page.cards.len(), "Partition page loaded");

        Ok(Box::new(HtmlScrollSession {
            extractor: self.clone(),
            base,
            rendered: page.cards,
            next: page.next,
            pending: None,
        }))
    }

    async fn open_detail(&self, locator: &str) -> Result<Box<dyn DetailPage>, ExtractError> {
        parse_url(locator)?;
        let html = self.fetch(locator).await?;
        let values = parse_detail(&html, &self.selectors);
        debug!(locator, fields = values.len(), "Detail page loaded");
        Ok(Box::new(HtmlDetailPage { values }))
    }
}

struct HtmlScrollSession {
    extractor: HtmlPageExtractor,
    base: Url,
    rendered: Vec<CandidateItem>,
    next: Option<String>,
    pending: Option<Vec<CandidateItem>>,
}

#[async_trait]
impl ScrollSession for HtmlScrollSession {
    async fn scroll_marker(&mut self) -> Result<u64, ExtractError> {
        Ok(u64::try_from(self.rendered.len()).unwrap_or(u64::MAX))
    }

    async fn visible_items(&mut self) -> Result<Vec<CandidateItem>, ExtractError> {
        Ok(self.rendered.clone())
    }

    async fn scroll(&mut self) -> Result<(), ExtractError> {
        if let Some(batch) = self.pending.take() {
            self.rendered.extend(batch);
        }
        Ok(())
    }

    async fn load_more(&mut self) -> Result<bool, ExtractError> {
        let Some(url) = self.next.take() else {
            return Ok(false);
        };
        let html = self.extractor.fetch(&url).await?;
        let page = parse_listing(&html, &self.extractor.selectors, &self.base);
        debug!(url = %url, cards = page.cards.len(), "Loaded more results");

        self.next = page.next.filter(|next| *next != url);
        self.pending.get_or_insert_with(Vec::new).extend(page.cards);
        Ok(true)
    }
}

/// Detail page parsed up front into per-field values.
struct HtmlDetailPage {
    values: HashMap<DetailField, Vec<String>>,
}

#[async_trait]
impl DetailPage for HtmlDetailPage {
    async fn read_text(&self, field: DetailField) -> Result<String, ExtractError> {
        self.values
            .get(&field)
            .and_then(|values| values.first())
            .cloned()
            .ok_or(ExtractError::FieldMissing(field))
    }

    async fn read_all(&self, field: DetailField) -> Result<Vec<String>, ExtractError> {
        match self.values.get(&field) {
            Some(values) if !values.is_empty() => Ok(values.clone()),
            _ => Err(ExtractError::FieldMissing(field)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
          <div class="kt-post-card"><a href="/v/house-one/AAA"><h2 class="kt-post-card__title">House   one</h2></a></div>
          <div class="kt-post-card"><a href="https://divar.ir/v/house-two/BBB"><h2 class="kt-post-card__title">House two</h2></a></div>
          <div class="kt-post-card"><span>no link</span></div>
          <a class="post-list__load-more-btn" href="?page=2">more</a>
        </body></html>"#;

    const DETAIL: &str = r#"
        <html><head><title>House one - 12 مهر 1402</title></head><body>
          <div class="kt-page-title__subtitle">آپارتمان در تهران، نیاوران</div>
          <div class="kt-base-row"><p class="kt-base-row__title">طبقه</p><p class="kt-unexpandable-row__value">۳ از ۵</p></div>
          <div class="kt-base-row"><p class="kt-base-row__title">قیمت کل</p><p class="kt-unexpandable-row__value">۱۲٬۵۰۰٬۰۰۰ تومان</p></div>
          <picture><img src="https://img.example/1.jpg"></picture>
          <picture><img data-src="https://img.example/2.jpg"></picture>
        </body></html>"#;

    fn selectors() -> CompiledSelectors {
        CompiledSelectors::new(&ExtractorConfig::default()).unwrap()
    }

    #[test]
    fn listing_cards_are_resolved_against_base() {
        let base = Url::parse("https://divar.ir/s/tehran/buy-villa").unwrap();
        let page = parse_listing(LISTING, &selectors(), &base);

        assert_eq!(page.cards.len(), 2);
        assert_eq!(page.cards[0].label, "House one");
        assert_eq!(page.cards[0].locator, "https://divar.ir/v/house-one/AAA");
        assert_eq!(page.cards[1].locator, "https://divar.ir/v/house-two/BBB");
        assert_eq!(page.next.as_deref(), Some("https://divar.ir/s/tehran/buy-villa?page=2"));
    }

    #[test]
    fn detail_reads_labelled_rows_and_image_attributes() {
        let values = parse_detail(DETAIL, &selectors());

        assert_eq!(values[&DetailField::Floor], vec!["۳ از ۵".to_string()]);
        assert_eq!(values[&DetailField::Price], vec!["۱۲٬۵۰۰٬۰۰۰ تومان".to_string()]);
        assert_eq!(values[&DetailField::Subtitle], vec!["آپارتمان در تهران، نیاوران".to_string()]);
        assert_eq!(values[&DetailField::Images].len(), 2);
        assert!(values[&DetailField::Title][0].contains("1402"));
        assert!(!values.contains_key(&DetailField::Seller));
    }

    #[tokio::test]
    async fn detail_page_reports_missing_fields() {
        let page = HtmlDetailPage {
            values: parse_detail(DETAIL, &selectors()),
        };
        assert!(page.read_text(DetailField::Floor).await.is_ok());
        assert_eq!(
            page.read_text(DetailField::Seller).await,
            Err(ExtractError::FieldMissing(DetailField::Seller))
        );
    }

    #[test]
    fn invalid_card_selector_is_rejected() {
        let config = ExtractorConfig {
            card_selector: "[[".into(),
            ..ExtractorConfig::default()
        };
        assert!(CompiledSelectors::new(&config).is_err());
    }
}
