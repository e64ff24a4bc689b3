//! In-flight work never exceeds the configured limits.

use std::sync::Arc;
use std::time::Duration;

use listing_crawler::crawling::enrichment::EnrichmentPolicy;
use listing_crawler::crawling::limiter::ConcurrencyLimiter;
use listing_crawler::crawling::monitor::ResourceMonitor;
use listing_crawler::test_utils::{FixedSampler, MemorySink, MemoryStatsSink, ScriptedExtractor};
use listing_crawler::{CandidateItem, Orchestrator, OrchestratorSettings, SourcePartition};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn item_limit_bounds_detail_fetches() {
    let items: Vec<CandidateItem> = (0..20)
        .map(|n| CandidateItem::new(format!("House {n}"), format!("u{n}")))
        .collect();
    let extractor = Arc::new(
        ScriptedExtractor::new()
            .with_partition("tehran/buy-apartment", vec![items])
            .with_detail_delay(Duration::from_millis(50)),
    );
    let settings = OrchestratorSettings {
        max_item_concurrency: 3,
        partitions: vec![SourcePartition::new(
            "tehran",
            "buy-apartment",
            "https://listings.test/s/tehran/buy-apartment",
        )],
        enrichment: EnrichmentPolicy {
            per_item_timeout: Duration::from_secs(5),
            politeness_min: Duration::ZERO,
            politeness_max: Duration::ZERO,
        },
        ..OrchestratorSettings::default()
    };
    let monitor = ResourceMonitor::new(settings.sample_interval, Arc::new(FixedSampler::new(1024, 1.0)));
    let orchestrator = Orchestrator::with_monitor(
        settings,
        extractor.clone(),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStatsSink::default()),
        monitor,
    )
    .unwrap();

    let report = orchestrator.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.enriched, 20);
    assert!(extractor.peak_in_flight() <= 3);
    assert!(orchestrator.item_limiter().peak() <= 3);
    assert!(orchestrator.item_limiter().peak() >= 1);
    assert_eq!(orchestrator.item_limiter().in_use(), 0);
}

#[tokio::test(start_paused = true)]
async fn partition_limit_bounds_discovery() {
    let labels = ["a", "b", "c", "d", "e", "f"];
    let mut extractor = ScriptedExtractor::new().with_scroll_delay(Duration::from_millis(200));
    for label in labels {
        extractor = extractor.with_partition(
            &format!("tehran/{label}"),
            vec![vec![CandidateItem::new(format!("House {label}"), format!("u-{label}"))]],
        );
    }
    let settings = OrchestratorSettings {
        max_partition_concurrency: 2,
        partitions: labels
            .iter()
            .map(|label| SourcePartition::new("tehran", *label, format!("https://listings.test/s/tehran/{label}")))
            .collect(),
        enrichment: EnrichmentPolicy {
            per_item_timeout: Duration::from_secs(5),
            politeness_min: Duration::ZERO,
            politeness_max: Duration::ZERO,
        },
        ..OrchestratorSettings::default()
    };
    let monitor = ResourceMonitor::new(settings.sample_interval, Arc::new(FixedSampler::new(1024, 1.0)));
    let orchestrator = Orchestrator::with_monitor(
        settings,
        Arc::new(extractor),
        Arc::new(MemorySink::default()),
        Arc::new(MemoryStatsSink::default()),
        monitor,
    )
    .unwrap();

    let report = orchestrator.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.candidates, labels.len());
    assert_eq!(orchestrator.partition_limiter().peak(), 2);
    assert_eq!(orchestrator.partition_limiter().in_use(), 0);
}

#[tokio::test]
async fn slots_are_returned_when_holders_finish() {
    let limiter = ConcurrencyLimiter::new("test", 4);
    let mut holders = JoinSet::new();

    for _ in 0..32 {
        let limiter = limiter.clone();
        holders.spawn(async move {
            let _slot = limiter.acquire().await.unwrap();
            assert!(limiter.in_use() <= limiter.capacity());
            tokio::task::yield_now().await;
        });
    }
    while let Some(joined) = holders.join_next().await {
        joined.unwrap();
    }

    assert!(limiter.peak() <= 4);
    assert_eq!(limiter.in_use(), 0);
}
