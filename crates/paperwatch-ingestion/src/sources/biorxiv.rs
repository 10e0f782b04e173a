//! bioRxiv / medRxiv preprint client.
//!
//! Uses the bioRxiv REST API:
//!   https://api.biorxiv.org/details/{server}/{from}/{to}/{cursor}/json
//!
//! The API has no free-text search, so keyword filtering happens client
//! side over title + abstract.

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::{debug, instrument};

use super::SourceAdapter;
use paperwatch_common::{PaperRecord, SourceId};

const API_BASE: &str = "https://api.biorxiv.org/details";

pub struct RxivAdapter {
    client: reqwest::Client,
    /// "biorxiv" or "medrxiv"
    server: &'static str,
    source: SourceId,
}

impl RxivAdapter {
    pub fn biorxiv() -> Self {
        Self {
            client: super::http_client(),
            server: "biorxiv",
            source: SourceId::BioRxiv,
        }
    }

    pub fn medrxiv() -> Self {
        Self {
            client: super::http_client(),
            server: "medrxiv",
            source: SourceId::MedRxiv,
        }
    }

    #[instrument(skip(self, keywords))]
    async fn fetch_window(
        &self,
        since: NaiveDate,
        keywords: &[String],
        max_results: usize,
    ) -> anyhow::Result<Vec<PaperRecord>> {
        let today = chrono::Utc::now().date_naive();
        let url = format!("{API_BASE}/{}/{}/{}/0/json", self.server, since, today);
        let resp: serde_json::Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let collection = resp["collection"].as_array().cloned().unwrap_or_default();
        debug!(server = self.server, fetched = collection.len(), "API response");

        let keywords_lower: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();

        let papers = collection
            .iter()
            .filter(|item| {
                let title = item["title"].as_str().unwrap_or("").to_lowercase();
                let abstract_ = item["abstract"].as_str().unwrap_or("").to_lowercase();
                keywords_lower
                    .iter()
                    .any(|kw| title.contains(kw) || abstract_.contains(kw))
            })
            .map(|item| self.parse_item(item))
            .take(max_results)
            .collect();

        Ok(papers)
    }

    fn parse_item(&self, item: &serde_json::Value) -> PaperRecord {
        let doi = item["doi"].as_str().map(String::from);
        let url = doi
            .as_deref()
            .map(|d| format!("https://doi.org/{d}"))
            .unwrap_or_default();
        // Authors come as one "Last, F.; Last, F." string.
        let authors: Vec<String> = item["authors"]
            .as_str()
            .unwrap_or("")
            .split(';')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let published = item["date"]
            .as_str()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());

        PaperRecord {
            doi,
            title: item["title"].as_str().unwrap_or("").to_string(),
            abstract_text: item["abstract"].as_str().unwrap_or("").to_string(),
            authors,
            journal: if self.server == "biorxiv" { "bioRxiv" } else { "medRxiv" }.to_string(),
            published,
            source: self.source,
            url,
        }
    }
}

#[async_trait]
impl SourceAdapter for RxivAdapter {
    fn id(&self) -> SourceId {
        self.source
    }

    async fn fetch(
        &self,
        keywords: &[String],
        since: NaiveDate,
        max_results: usize,
    ) -> anyhow::Result<Vec<PaperRecord>> {
        self.fetch_window(since, keywords, max_results).await
    }
}
