//! # Aggregation Stage
//!
//! Fan-in of the two enrichment channels. Reads both until both are closed,
//! tracking open/closed state per channel. Output order is arrival order and
//! nothing is deduplicated here.

use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{EnrichedItem, ErrorRecord};

/// The two final collections of one run.
#[derive(Debug, Default, Clone)]
pub struct AggregateOutput {
    pub items: Vec<EnrichedItem>,
    pub errors: Vec<ErrorRecord>,
}

impl AggregateOutput {
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.items.is_empty() && !self.errors.is_empty()
    }
}

pub struct Aggregator;

impl Aggregator {
    /// Drains both receivers to completion.
    pub async fn collect(
        mut items: mpsc::Receiver<EnrichedItem>,
        mut errors: mpsc::Receiver<ErrorRecord>,
    ) -> AggregateOutput {
        let mut output = AggregateOutput::default();
        let mut items_open = true;
        let mut errors_open = true;

        while items_open || errors_open {
            tokio::select! {
                received = items.recv(), if items_open => match received {
                    Some(item) => output.items.push(item),
                    None => {
                        debug!(items = output.items.len(), "Item channel closed");
                        items_open = false;
                    }
                },
                received = errors.recv(), if errors_open => match received {
                    Some(record) => output.errors.push(record),
                    None => {
                        debug!(errors = output.errors.len(), "Error channel closed");
                        errors_open = false;
                    }
                },
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CandidateItem, DetailFields};

    #[tokio::test]
    async fn collects_until_both_closed() {
        let (item_tx, item_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);

        let collector = tokio::spawn(Aggregator::collect(item_rx, error_rx));

        drop(error_tx);
        for n in 0..3 {
            let candidate = CandidateItem::new(format!("House {n}"), format!("u{n}"));
            item_tx
                .send(EnrichedItem::new(&candidate, "tehran/buy-villa", DetailFields::default()))
                .await
                .unwrap();
        }
        drop(item_tx);

        let output = collector.await.unwrap();
        assert_eq!(output.items.len(), 3);
        assert!(output.errors.is_empty());
        assert!(!output.is_total_failure());
    }

    #[tokio::test]
    async fn same_locator_is_not_deduplicated() {
        let (item_tx, item_rx) = mpsc::channel(4);
        let (error_tx, error_rx) = mpsc::channel::<ErrorRecord>(4);
        let candidate = CandidateItem::new("House 1", "u1");
        item_tx.send(EnrichedItem::new(&candidate, "a", DetailFields::default())).await.unwrap();
        item_tx.send(EnrichedItem::new(&candidate, "b", DetailFields::default())).await.unwrap();
        drop(item_tx);
        drop(error_tx);

        let output = Aggregator::collect(item_rx, error_rx).await;
        assert_eq!(output.items.len(), 2);
    }
}
