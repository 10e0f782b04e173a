//! Data model shared by the whole pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Where a record was fetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    PubMed,
    BioRxiv,
    Arxiv,
    MedRxiv,
    Other,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::PubMed  => "pubmed",
            SourceId::BioRxiv => "biorxiv",
            SourceId::Arxiv   => "arxiv",
            SourceId::MedRxiv => "medrxiv",
            SourceId::Other   => "other",
        }
    }

    pub fn parse(s: &str) -> SourceId {
        match s {
            "pubmed"  => SourceId::PubMed,
            "biorxiv" => SourceId::BioRxiv,
            "arxiv"   => SourceId::Arxiv,
            "medrxiv" => SourceId::MedRxiv,
            _         => SourceId::Other,
        }
    }

    /// True for sources that publish peer-reviewed articles.
    pub fn is_peer_reviewed(&self) -> bool {
        matches!(self, SourceId::PubMed)
    }

    /// Preference order used when merging duplicate records.
    /// Lower wins for display fields; keeps the merge order-independent.
    pub fn display_rank(&self) -> u8 {
        match self {
            SourceId::PubMed  => 0,
            SourceId::BioRxiv => 1,
            SourceId::Arxiv   => 2,
            SourceId::MedRxiv => 3,
            SourceId::Other   => 4,
        }
    }
}

/// One paper as fetched from a source, before dedup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub doi: Option<String>,
    pub title: String,
    pub abstract_text: String,
    /// Ordered author names as the source reports them.
    pub authors: Vec<String>,
    pub journal: String,
    pub published: Option<NaiveDate>,
    pub source: SourceId,
    pub url: String,
}

impl PaperRecord {
    /// Title + abstract, the text all keyword and semantic matching runs over.
    pub fn match_text(&self) -> String {
        format!("{} {}", self.title, self.abstract_text)
    }
}

/// Stable identity for a paper across sources.
///
/// Either a normalized DOI or, when the DOI is absent, a composite of
/// normalized title, first-author surname and publication date. Two records
/// sharing a key represent the same paper and must merge into one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// Derive the key for a record. Returns `None` for records too malformed
    /// to identify (no DOI, and no title or no author to fall back on).
    pub fn for_record(record: &PaperRecord) -> Option<CanonicalKey> {
        if let Some(doi) = record.doi.as_deref() {
            let doi = normalize_doi(doi);
            if !doi.is_empty() {
                return Some(CanonicalKey(format!("doi:{doi}")));
            }
        }

        let title = normalize_title(&record.title);
        let surname = record.authors.first().map(|a| surname_of(a))?;
        if title.is_empty() || surname.is_empty() {
            return None;
        }
        let date = record
            .published
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        Some(CanonicalKey(format!("t:{title}|a:{surname}|d:{date}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rehydrate a key previously persisted via `as_str`.
    pub fn from_stored(s: impl Into<String>) -> CanonicalKey {
        CanonicalKey(s.into())
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lower-case and strip resolver prefixes ("https://doi.org/", "doi:", …).
fn normalize_doi(doi: &str) -> String {
    let doi = doi.trim().to_lowercase();
    let doi = doi
        .strip_prefix("https://doi.org/")
        .or_else(|| doi.strip_prefix("http://doi.org/"))
        .or_else(|| doi.strip_prefix("https://dx.doi.org/"))
        .or_else(|| doi.strip_prefix("http://dx.doi.org/"))
        .or_else(|| doi.strip_prefix("doi:"))
        .unwrap_or(&doi);
    doi.trim().to_string()
}

/// Lower-case, drop punctuation, collapse whitespace.
fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_space = true;
    for c in title.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Last whitespace-separated token of an author name, lower-cased.
/// Handles both "Jane Smith" and "Smith, Jane".
fn surname_of(author: &str) -> String {
    let author = author.trim();
    if let Some((last, _)) = author.split_once(',') {
        return last.trim().to_lowercase();
    }
    author
        .rsplit_once(char::is_whitespace)
        .map(|(_, last)| last)
        .unwrap_or(author)
        .to_lowercase()
}

/// Coarse editorial-quality bucket for a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalTier {
    Tier1,
    Tier2,
    Ml,
    Preprint,
    Unclassified,
}

impl JournalTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalTier::Tier1        => "tier1",
            JournalTier::Tier2        => "tier2",
            JournalTier::Ml           => "ml",
            JournalTier::Preprint     => "preprint",
            JournalTier::Unclassified => "unclassified",
        }
    }

    pub fn parse(s: &str) -> Option<JournalTier> {
        match s.to_lowercase().as_str() {
            "tier1"             => Some(JournalTier::Tier1),
            "tier2"             => Some(JournalTier::Tier2),
            "ml" | "ml-focused" => Some(JournalTier::Ml),
            "preprint"          => Some(JournalTier::Preprint),
            "unclassified"      => Some(JournalTier::Unclassified),
            _                   => None,
        }
    }
}

/// A paper annotated with every relevance signal, produced fresh each run.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredPaper {
    pub paper: PaperRecord,
    pub key: CanonicalKey,
    pub tier: JournalTier,
    pub boolean_match: bool,
    /// Cosine similarity clamped to [0, 1]; `None` when embedding was
    /// unavailable for this run.
    pub semantic_score: Option<f32>,
    /// LLM relevance in [0, 1]; `None` when the scorer was down for the
    /// whole run and ranking degraded to the semantic/date fallback.
    pub llm_score: Option<f32>,
    pub llm_explanation: Option<String>,
    /// Position in the final digest ordering, assigned by the ranker.
    pub final_rank: usize,
}

/// A standing keyword subscription, evaluated on every digest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    /// Opaque owner reference (user or channel id of the chat layer).
    pub owner_ref: String,
    pub keywords: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable record of a paper the pipeline has already surfaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub key: CanonicalKey,
    pub first_seen_at: DateTime<Utc>,
    pub last_digested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doi: Option<&str>, title: &str, author: &str, date: Option<&str>) -> PaperRecord {
        PaperRecord {
            doi: doi.map(String::from),
            title: title.to_string(),
            abstract_text: String::new(),
            authors: if author.is_empty() { vec![] } else { vec![author.to_string()] },
            journal: String::new(),
            published: date.and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok()),
            source: SourceId::PubMed,
            url: String::new(),
        }
    }

    #[test]
    fn doi_key_is_case_and_prefix_insensitive() {
        let a = record(Some("10.1000/XYZ"), "t", "a b", None);
        let b = record(Some("https://doi.org/10.1000/xyz"), "other", "c d", None);
        assert_eq!(
            CanonicalKey::for_record(&a),
            CanonicalKey::for_record(&b)
        );
    }

    #[test]
    fn fallback_key_uses_title_surname_date() {
        let a = record(None, "Single-cell RNA atlas!", "Jane Smith", Some("2024-03-01"));
        let b = record(None, "single cell rna ATLAS", "Smith, Jane", Some("2024-03-01"));
        let key = CanonicalKey::for_record(&a).unwrap();
        assert_eq!(Some(key.clone()), CanonicalKey::for_record(&b));
        assert_eq!(key.as_str(), "t:single cell rna atlas|a:smith|d:2024-03-01");
    }

    #[test]
    fn malformed_record_has_no_key() {
        let r = record(None, "", "", None);
        assert!(CanonicalKey::for_record(&r).is_none());
    }

    #[test]
    fn empty_doi_falls_back_to_composite() {
        let r = record(Some("  "), "A title", "Jane Smith", Some("2024-01-01"));
        let key = CanonicalKey::for_record(&r).unwrap();
        assert!(key.as_str().starts_with("t:"));
    }

    #[test]
    fn tier_parse_roundtrip() {
        for tier in [
            JournalTier::Tier1,
            JournalTier::Tier2,
            JournalTier::Ml,
            JournalTier::Preprint,
            JournalTier::Unclassified,
        ] {
            assert_eq!(JournalTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(JournalTier::parse("ML-Focused"), Some(JournalTier::Ml));
        assert_eq!(JournalTier::parse("nope"), None);
    }
}
