//! Source adapter clients.

pub mod arxiv;
pub mod biorxiv;
pub mod pubmed;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

use paperwatch_common::config::SearchConfig;
use paperwatch_common::{PaperRecord, SourceId};

/// Common interface for all paper metadata sources.
///
/// One call returns a bounded collection; adapters never stream. A failing
/// adapter yields an error that the fetch stage downgrades to a stage-local
/// skip.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> SourceId;

    /// Fetch records matching any of the keywords, published on or after
    /// `since`.
    async fn fetch(
        &self,
        keywords: &[String],
        since: NaiveDate,
        max_results: usize,
    ) -> anyhow::Result<Vec<PaperRecord>>;
}

/// Shared HTTP client for source adapters.
pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .user_agent("paperwatch/0.1 (research digest)")
        .build()
        .unwrap_or_default()
}

/// Build the adapter set named by `search.databases`. Unknown identifiers
/// were already rejected by config validation and are skipped here.
pub fn adapters_from_config(search: &SearchConfig) -> Vec<Arc<dyn SourceAdapter>> {
    let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();
    for db in &search.databases {
        match db.as_str() {
            "pubmed" => {
                let api_key = (!search.ncbi_api_key.is_empty())
                    .then(|| search.ncbi_api_key.clone())
                    .or_else(|| std::env::var("PAPERWATCH_NCBI_API_KEY").ok());
                adapters.push(Arc::new(pubmed::PubMedAdapter::new(api_key)));
            }
            "biorxiv" => adapters.push(Arc::new(biorxiv::RxivAdapter::biorxiv())),
            "medrxiv" => adapters.push(Arc::new(biorxiv::RxivAdapter::medrxiv())),
            "arxiv"   => adapters.push(Arc::new(arxiv::ArxivAdapter::new())),
            other => tracing::warn!(source = other, "Unknown source identifier, skipping"),
        }
    }
    adapters
}
