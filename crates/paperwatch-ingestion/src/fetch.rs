//! Concurrent fan-out over source adapters.
//!
//! Adapters fetch in parallel under a concurrency bound. A slow or failing
//! adapter never blocks the others: its error is downgraded to a
//! stage-local [`SourceFailure`] and the run continues with what the rest
//! returned.

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::sources::SourceAdapter;
use paperwatch_common::{PaperRecord, SourceId};

/// Transient-failure retries per adapter before the source is skipped.
const FETCH_RETRIES: u32 = 2;

/// Exponential backoff: 2^attempt seconds (2s, 4s, ...).
const fn backoff_duration(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

#[derive(Debug, Clone)]
pub struct SourceFailure {
    pub source: SourceId,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub records: Vec<PaperRecord>,
    pub failures: Vec<SourceFailure>,
}

/// Fetch from every adapter, at most `concurrency` in flight at once.
#[instrument(skip(adapters, keywords), fields(n_sources = adapters.len()))]
pub async fn fetch_all(
    adapters: &[Arc<dyn SourceAdapter>],
    keywords: &[String],
    since: NaiveDate,
    max_results: usize,
    concurrency: usize,
) -> FetchOutcome {
    let results = stream::iter(adapters.iter().cloned())
        .map(|adapter| {
            let keywords = keywords.to_vec();
            async move {
                let source = adapter.id();
                let result = fetch_with_retry(adapter.as_ref(), &keywords, since, max_results).await;
                (source, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut outcome = FetchOutcome::default();
    for (source, result) in results {
        match result {
            Ok(records) => {
                info!(source = source.as_str(), n = records.len(), "Papers retrieved");
                outcome.records.extend(records);
            }
            Err(e) => {
                warn!(source = source.as_str(), error = %e, "Source skipped after retries");
                outcome.failures.push(SourceFailure {
                    source,
                    message: e.to_string(),
                });
            }
        }
    }
    outcome
}

async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    keywords: &[String],
    since: NaiveDate,
    max_results: usize,
) -> anyhow::Result<Vec<PaperRecord>> {
    let mut attempt = 0u32;
    loop {
        match adapter.fetch(keywords, since, max_results).await {
            Ok(records) => return Ok(records),
            Err(e) if attempt < FETCH_RETRIES => {
                attempt += 1;
                warn!(
                    source = adapter.id().as_str(),
                    attempt,
                    error = %e,
                    "Fetch failed, retrying"
                );
                tokio::time::sleep(backoff_duration(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeAdapter {
        source: SourceId,
        fail_first: u32,
        calls: AtomicU32,
        records: Vec<PaperRecord>,
    }

    impl FakeAdapter {
        fn new(source: SourceId, fail_first: u32, n_records: usize) -> Self {
            let records = (0..n_records)
                .map(|i| PaperRecord {
                    doi: Some(format!("10.1/{}{i}", source.as_str())),
                    title: format!("paper {i}"),
                    abstract_text: String::new(),
                    authors: vec!["A B".to_string()],
                    journal: "Nature".to_string(),
                    published: None,
                    source,
                    url: String::new(),
                })
                .collect();
            Self { source, fail_first, calls: AtomicU32::new(0), records }
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn id(&self) -> SourceId {
            self.source
        }

        async fn fetch(
            &self,
            _keywords: &[String],
            _since: NaiveDate,
            _max_results: usize,
        ) -> anyhow::Result<Vec<PaperRecord>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                anyhow::bail!("simulated transient failure");
            }
            Ok(self.records.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_source_does_not_block_others() {
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
            Arc::new(FakeAdapter::new(SourceId::PubMed, 0, 2)),
            Arc::new(FakeAdapter::new(SourceId::Arxiv, u32::MAX, 0)),
        ];
        let since = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let outcome = fetch_all(&adapters, &["x".to_string()], since, 10, 4).await;
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].source, SourceId::Arxiv);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let adapter = Arc::new(FakeAdapter::new(SourceId::PubMed, 1, 1));
        let adapters: Vec<Arc<dyn SourceAdapter>> = vec![adapter.clone()];
        let since = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let outcome = fetch_all(&adapters, &["x".to_string()], since, 10, 1).await;
        assert_eq!(outcome.records.len(), 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }
}
