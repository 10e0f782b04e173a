//! arXiv Atom API client.
//!
//! Endpoint: http://export.arxiv.org/api/query
//! Results are Atom XML; entries are filtered by publication date client
//! side since the API sorts but does not window by date.

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, instrument, warn};

use super::SourceAdapter;
use paperwatch_common::{PaperRecord, SourceId};

const API_URL: &str = "http://export.arxiv.org/api/query";

pub struct ArxivAdapter {
    client: reqwest::Client,
}

impl ArxivAdapter {
    pub fn new() -> Self {
        Self { client: super::http_client() }
    }

    fn build_query(keywords: &[String]) -> String {
        keywords
            .iter()
            .map(|kw| format!("all:\"{kw}\""))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

impl Default for ArxivAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for ArxivAdapter {
    fn id(&self) -> SourceId {
        SourceId::Arxiv
    }

    #[instrument(skip(self, keywords))]
    async fn fetch(
        &self,
        keywords: &[String],
        since: NaiveDate,
        max_results: usize,
    ) -> anyhow::Result<Vec<PaperRecord>> {
        let params = [
            ("search_query", Self::build_query(keywords)),
            ("start", "0".to_string()),
            ("max_results", max_results.to_string()),
            ("sortBy", "submittedDate".to_string()),
            ("sortOrder", "descending".to_string()),
        ];
        let xml = self
            .client
            .get(API_URL)
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let mut papers = parse_arxiv_atom(&xml)?;
        papers.retain(|p| p.published.map(|d| d >= since).unwrap_or(false));
        debug!(n = papers.len(), "arXiv entries in window");
        Ok(papers)
    }
}

/// Parse an arXiv Atom feed into PaperRecords.
fn parse_arxiv_atom(xml: &str) -> anyhow::Result<Vec<PaperRecord>> {
    let mut papers = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current: Option<PaperRecord> = None;
    let mut in_title     = false;
    let mut in_summary   = false;
    let mut in_author    = false;
    let mut in_name      = false;
    let mut in_id        = false;
    let mut in_published = false;
    let mut in_doi       = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"entry" => {
                    current = Some(PaperRecord {
                        doi: None,
                        title: String::new(),
                        abstract_text: String::new(),
                        authors: vec![],
                        journal: "arXiv".to_string(),
                        published: None,
                        source: SourceId::Arxiv,
                        url: String::new(),
                    });
                }
                b"title" if current.is_some()   => in_title = true,
                b"summary"                      => in_summary = true,
                b"author"                       => in_author = true,
                b"name" if in_author            => in_name = true,
                b"id" if current.is_some()      => in_id = true,
                b"published"                    => in_published = true,
                b"arxiv:doi"                    => in_doi = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if let Some(ref mut p) = current {
                    if in_title {
                        // Atom titles fold with embedded newlines.
                        p.title = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    }
                    if in_summary {
                        p.abstract_text = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    }
                    if in_name {
                        p.authors.push(text.clone());
                    }
                    if in_id {
                        p.url = text.clone();
                    }
                    if in_published {
                        // e.g. 2024-03-05T18:00:00Z
                        p.published = text
                            .get(..10)
                            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
                    }
                    if in_doi {
                        p.doi = Some(text.clone());
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"title"     => in_title = false,
                b"summary"   => in_summary = false,
                b"author"    => in_author = false,
                b"name"      => in_name = false,
                b"id"        => in_id = false,
                b"published" => in_published = false,
                b"arxiv:doi" => in_doi = false,
                b"entry" => {
                    if let Some(p) = current.take() {
                        if !p.title.is_empty() {
                            papers.push(p);
                        } else {
                            warn!("Skipping arXiv entry with empty title");
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("arXiv Atom parse error: {e}");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}
