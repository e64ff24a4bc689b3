//! Candidate merging cost as a scroll session grows, and cross-partition dedup.
//!
//! Each pagination round re-reads every rendered card, so merge work grows
//! with the page even though only the tail is new.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use listing_crawler::CandidateItem;
use listing_crawler::crawling::discovery::{CandidateSet, PartitionCandidate, dedupe_by_locator};

const CARDS_PER_ROUND: usize = 24;

fn card(n: usize) -> CandidateItem {
    CandidateItem::new(format!("Apartment {n}"), format!("https://listings.test/v/{n}"))
}

fn scroll_session(rounds: usize) -> usize {
    let mut set = CandidateSet::new();
    for round in 1..=rounds {
        let visible = (0..round * CARDS_PER_ROUND).map(card);
        black_box(set.merge(visible));
    }
    set.len()
}

fn merge_rounds(c: &mut Criterion) {
    let mut group = c.benchmark_group("candidate_merge");
    for rounds in [5, 20, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(rounds), &rounds, |b, &rounds| {
            b.iter(|| scroll_session(black_box(rounds)));
        });
    }
    group.finish();
}

fn cross_partition_dedup(c: &mut Criterion) {
    // Four partitions sharing half their locators
    let candidates: Vec<PartitionCandidate> = (0..4)
        .flat_map(|p| {
            (0..2_000).map(move |n| PartitionCandidate {
                partition: format!("tehran/p{p}"),
                item: card(if n % 2 == 0 { n } else { n + p * 10_000 }),
            })
        })
        .collect();

    c.bench_function("dedupe_by_locator_8000", |b| {
        b.iter(|| dedupe_by_locator(black_box(candidates.clone())));
    });
}

criterion_group!(benches, merge_rounds, cross_partition_dedup);
criterion_main!(benches);
