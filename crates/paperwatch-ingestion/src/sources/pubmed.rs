//! PubMed E-utilities client.
//!
//! Endpoints used:
//!   esearch: https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi
//!   efetch:  https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, instrument, warn};

use super::SourceAdapter;
use paperwatch_common::{PaperRecord, SourceId};

const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
const EFETCH_URL:  &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

pub struct PubMedAdapter {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl PubMedAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: super::http_client(),
            api_key,
        }
    }

    /// Build an esearch term: keywords OR-combined, bounded by a [PDAT] range.
    fn build_term(keywords: &[String], since: NaiveDate) -> String {
        let query = keywords
            .iter()
            .map(|kw| format!("\"{kw}\""))
            .collect::<Vec<_>>()
            .join(" OR ");
        let today = chrono::Utc::now().date_naive();
        format!(
            "({query}) AND ({}[PDAT] : {}[PDAT])",
            since.format("%Y/%m/%d"),
            today.format("%Y/%m/%d"),
        )
    }

    /// Search PubMed and return a list of PMIDs.
    #[instrument(skip(self))]
    async fn esearch(&self, term: &str, max: usize) -> anyhow::Result<Vec<String>> {
        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("term", term.to_string()),
            ("retmax", max.to_string()),
            ("retmode", "json".to_string()),
            ("sort", "pub_date".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let resp: serde_json::Value = self
            .client
            .get(ESEARCH_URL)
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let ids: Vec<String> = resp["esearchresult"]["idlist"]
            .as_array()
            .unwrap_or(&vec![])
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();

        debug!(n = ids.len(), "PubMed esearch returned PMIDs");
        Ok(ids)
    }

    /// Fetch PubMed XML for a list of PMIDs and parse into PaperRecords.
    #[instrument(skip(self, pmids), fields(n = pmids.len()))]
    async fn efetch(&self, pmids: &[String]) -> anyhow::Result<Vec<PaperRecord>> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }

        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("id", pmids.join(",")),
            ("rettype", "abstract".to_string()),
            ("retmode", "xml".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let xml = self
            .client
            .get(EFETCH_URL)
            .query(&params)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        parse_pubmed_xml(&xml)
    }
}

#[async_trait]
impl SourceAdapter for PubMedAdapter {
    fn id(&self) -> SourceId {
        SourceId::PubMed
    }

    async fn fetch(
        &self,
        keywords: &[String],
        since: NaiveDate,
        max_results: usize,
    ) -> anyhow::Result<Vec<PaperRecord>> {
        let term = Self::build_term(keywords, since);
        let pmids = self.esearch(&term, max_results).await?;
        self.efetch(&pmids).await
    }
}

/// Parse PubMed XML (efetch abstract mode) into PaperRecords.
/// Handles the <PubmedArticleSet><PubmedArticle> structure.
fn parse_pubmed_xml(xml: &str) -> anyhow::Result<Vec<PaperRecord>> {
    let mut papers = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    // State machine for XML parsing
    let mut current: Option<PaperRecord> = None;
    let mut pmid = String::new();
    let mut in_pmid      = false;
    let mut in_title     = false;
    let mut in_abstract  = false;
    let mut in_author    = false;
    let mut in_last_name = false;
    let mut in_fore_name = false;
    let mut in_journal   = false;
    let mut in_doi       = false;
    let mut in_pub_date  = false;
    let mut in_year      = false;
    let mut in_month     = false;
    let mut in_day       = false;
    let mut current_last = String::new();
    let mut current_fore = String::new();
    let mut year  = String::new();
    let mut month = String::new();
    let mut day   = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    current = Some(PaperRecord {
                        doi: None,
                        title: String::new(),
                        abstract_text: String::new(),
                        authors: vec![],
                        journal: String::new(),
                        published: None,
                        source: SourceId::PubMed,
                        url: String::new(),
                    });
                    pmid.clear();
                    year.clear();
                    month.clear();
                    day.clear();
                }
                b"PMID" if pmid.is_empty() => in_pmid = true,
                b"ArticleTitle" => in_title = true,
                b"AbstractText" => in_abstract = true,
                b"Author" => {
                    in_author = true;
                    current_last.clear();
                    current_fore.clear();
                }
                b"LastName" => in_last_name = true,
                b"ForeName" => in_fore_name = true,
                b"Title"    => in_journal = true,
                b"PubDate"  => in_pub_date = true,
                b"Year"  if in_pub_date => in_year = true,
                b"Month" if in_pub_date => in_month = true,
                b"Day"   if in_pub_date => in_day = true,
                b"ELocationID" => {
                    in_doi = attr_equals(e, b"EIdType", b"doi");
                }
                b"ArticleId" => {
                    in_doi = attr_equals(e, b"IdType", b"doi");
                }
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default().to_string();
                if in_pmid {
                    pmid = text.clone();
                }
                if let Some(ref mut p) = current {
                    if in_title {
                        p.title = text.clone();
                    }
                    if in_abstract {
                        // Structured abstracts carry several AbstractText nodes.
                        if !p.abstract_text.is_empty() {
                            p.abstract_text.push(' ');
                        }
                        p.abstract_text.push_str(&text);
                    }
                    if in_last_name { current_last = text.clone(); }
                    if in_fore_name { current_fore = text.clone(); }
                    if in_journal && p.journal.is_empty() { p.journal = text.clone(); }
                    if in_doi && p.doi.is_none() { p.doi = Some(text.clone()); }
                    if in_year  { year = text.clone(); }
                    if in_month { month = text.clone(); }
                    if in_day   { day = text.clone(); }
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"PMID"         => in_pmid = false,
                b"ArticleTitle" => in_title = false,
                b"AbstractText" => in_abstract = false,
                b"LastName"     => in_last_name = false,
                b"ForeName"     => in_fore_name = false,
                b"Title"        => in_journal = false,
                b"PubDate"      => in_pub_date = false,
                b"Year"         => in_year = false,
                b"Month"        => in_month = false,
                b"Day"          => in_day = false,
                b"ELocationID" | b"ArticleId" => in_doi = false,
                b"Author" => {
                    if in_author {
                        if let Some(ref mut p) = current {
                            let name = if current_fore.is_empty() {
                                current_last.clone()
                            } else {
                                format!("{} {}", current_fore, current_last)
                            };
                            if !name.is_empty() {
                                p.authors.push(name);
                            }
                        }
                        in_author = false;
                    }
                }
                b"PubmedArticle" => {
                    if let Some(mut p) = current.take() {
                        p.published = parse_pub_date(&year, &month, &day);
                        if !pmid.is_empty() {
                            p.url = format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/");
                        }
                        if !p.title.is_empty() {
                            papers.push(p);
                        } else {
                            warn!(pmid = %pmid, "Skipping PubMed article with empty title");
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("PubMed XML parse error: {e}");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(papers)
}

fn attr_equals(e: &quick_xml::events::BytesStart<'_>, name: &[u8], value: &[u8]) -> bool {
    e.attributes()
        .flatten()
        .any(|a| a.key.as_ref() == name && a.value.as_ref() == value)
}

/// PubDate components: Year required, Month may be numeric or "Jan".."Dec",
/// missing Month/Day default to 1.
fn parse_pub_date(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    let year: i32 = year.parse().ok()?;
    let month = match month {
        "" => 1,
        m => m.parse().ok().or_else(|| month_name_to_number(m))?,
    };
    let day: u32 = if day.is_empty() { 1 } else { day.parse().ok()? };
    NaiveDate::from_ymd_opt(year, month, day)
}

fn month_name_to_number(name: &str) -> Option<u32> {
    let idx = [
        "jan", "feb", "mar", "apr", "may", "jun",
        "jul", "aug", "sep", "oct", "nov", "dec",
    ]
    .iter()
    .position(|m| name.to_lowercase().starts_with(m))?;
    Some(idx as u32 + 1)
}
