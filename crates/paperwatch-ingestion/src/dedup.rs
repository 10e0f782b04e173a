//! Deduplication of fetched records into canonical-keyed papers.
//!
//! Merging is commutative and associative: display fields come from the
//! record that is minimal under a total preference order, so the result is
//! identical for any permutation of the input.

use std::collections::HashMap;
use tracing::warn;

use paperwatch_common::{CanonicalKey, PaperRecord};

#[derive(Debug, Default)]
pub struct DedupOutcome {
    pub papers: HashMap<CanonicalKey, PaperRecord>,
    /// Records too malformed to key (no DOI and no title/author fallback).
    pub skipped: usize,
}

/// Collapse a collection of possibly-duplicated records to one per key.
pub fn dedup(records: Vec<PaperRecord>) -> DedupOutcome {
    let mut outcome = DedupOutcome::default();
    for record in records {
        let Some(key) = CanonicalKey::for_record(&record) else {
            warn!(source = record.source.as_str(), "Skipping unkeyable record");
            outcome.skipped += 1;
            continue;
        };
        match outcome.papers.remove(&key) {
            None => {
                outcome.papers.insert(key, record);
            }
            Some(existing) => {
                outcome.papers.insert(key, merge(existing, record));
            }
        }
    }
    outcome
}

/// Total preference order for display fields: peer-reviewed sources first,
/// then a lexicographic tie-break so equal-rank merges stay deterministic.
fn preferred_first(a: PaperRecord, b: PaperRecord) -> (PaperRecord, PaperRecord) {
    let key_of = |r: &PaperRecord| {
        (
            r.source.display_rank(),
            r.title.clone(),
            r.journal.clone(),
            r.abstract_text.clone(),
            r.url.clone(),
        )
    };
    if key_of(&a) <= key_of(&b) {
        (a, b)
    } else {
        (b, a)
    }
}

/// Merge two records that share a canonical key.
///
/// Display fields (title, abstract, journal, url, source) come from the
/// preferred record; authors are unioned with the preferred record's order
/// first; the earliest observed publication date wins.
fn merge(a: PaperRecord, b: PaperRecord) -> PaperRecord {
    let (mut primary, secondary) = preferred_first(a, b);

    // Union authors, preserving primary order, case-insensitive identity.
    let known: Vec<String> = primary.authors.iter().map(|a| a.to_lowercase()).collect();
    for author in secondary.authors {
        if !known.contains(&author.to_lowercase()) {
            primary.authors.push(author);
        }
    }

    primary.published = match (primary.published, secondary.published) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    if primary.doi.is_none() {
        primary.doi = secondary.doi;
    }
    if primary.abstract_text.is_empty() {
        primary.abstract_text = secondary.abstract_text;
    }
    if primary.url.is_empty() {
        primary.url = secondary.url;
    }

    primary
}
