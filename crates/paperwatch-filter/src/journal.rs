//! Journal tier classification and the journal filter policy.
//!
//! Classification is a pure function of the journal name plus a static alias
//! table; it never depends on run order.

use paperwatch_common::config::JournalsConfig;
use paperwatch_common::JournalTier;
use std::collections::HashSet;

/// Abbreviation → canonical journal name. Keys are normalized
/// (lower-cased, punctuation stripped).
const ALIASES: &[(&str, &str)] = &[
    ("nejm",                            "the new england journal of medicine"),
    ("new england journal of medicine", "the new england journal of medicine"),
    ("pnas",                            "proceedings of the national academy of sciences"),
    ("proc natl acad sci",              "proceedings of the national academy of sciences"),
    ("jmlr",                            "journal of machine learning research"),
    ("nat methods",                     "nature methods"),
    ("nat commun",                      "nature communications"),
    ("nat biotechnol",                  "nature biotechnology"),
    ("nat genet",                       "nature genetics"),
    ("nat med",                         "nature medicine"),
    ("nat mach intell",                 "nature machine intelligence"),
    ("lancet",                          "the lancet"),
];

const TIER1: &[&str] = &[
    "nature",
    "science",
    "cell",
    "the new england journal of medicine",
    "the lancet",
];

const TIER2: &[&str] = &[
    "nature methods",
    "nature communications",
    "nature medicine",
    "proceedings of the national academy of sciences",
    "elife",
    "nature biotechnology",
    "nature genetics",
];

const ML: &[&str] = &[
    "neurips",
    "icml",
    "iclr",
    "nature machine intelligence",
    "journal of machine learning research",
];

/// Matched as substrings: sources report variants like "bioRxiv preprint".
const PREPRINT_SERVERS: &[&str] = &["biorxiv", "arxiv", "medrxiv"];

/// Lower-case, strip punctuation, collapse whitespace.
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_space = true;
    for c in name.chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if c.is_whitespace() && !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
        // Other punctuation is dropped entirely ("Nat. Methods" → "nat methods").
    }
    out.trim_end().to_string()
}

/// Resolve a normalized name through the alias table.
fn canonical(normalized: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(normalized)
}

/// Map a journal name to its tier.
pub fn classify(journal: &str) -> JournalTier {
    let normalized = normalize(journal);
    if normalized.is_empty() {
        return JournalTier::Unclassified;
    }
    if PREPRINT_SERVERS.iter().any(|p| normalized.contains(p)) {
        return JournalTier::Preprint;
    }
    let name = canonical(&normalized);
    if TIER1.contains(&name) {
        JournalTier::Tier1
    } else if TIER2.contains(&name) {
        JournalTier::Tier2
    } else if ML.contains(&name) {
        JournalTier::Ml
    } else {
        JournalTier::Unclassified
    }
}

/// Journal filter built once per run from the `[journals]` config section.
///
/// A paper passes when its journal is in `include`, or its tier is in the
/// configured tier set, or it is a preprint and preprints are shown — and its
/// journal is not in `exclude`. Exclude always wins. Unclassified journals
/// are dropped unless explicitly included.
#[derive(Debug, Clone)]
pub struct JournalFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
    tiers: HashSet<JournalTier>,
    show_preprints: bool,
}

impl JournalFilter {
    pub fn from_config(config: &JournalsConfig) -> JournalFilter {
        JournalFilter {
            include: config.include.iter().map(|j| normalize(j)).collect(),
            exclude: config.exclude.iter().map(|j| normalize(j)).collect(),
            tiers: config
                .tiers
                .iter()
                .filter_map(|t| JournalTier::parse(t))
                .collect(),
            show_preprints: config.show_preprints,
        }
    }

    pub fn passes(&self, journal: &str, tier: JournalTier) -> bool {
        let normalized = normalize(journal);
        if self.exclude.contains(&normalized) {
            return false;
        }
        if self.include.contains(&normalized) {
            return true;
        }
        if self.tiers.contains(&tier) {
            return true;
        }
        tier == JournalTier::Preprint && self.show_preprints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(
        include: &[&str],
        exclude: &[&str],
        tiers: &[&str],
        show_preprints: bool,
    ) -> JournalsConfig {
        JournalsConfig {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            tiers: tiers.iter().map(|s| s.to_string()).collect(),
            show_preprints,
        }
    }

    #[test]
    fn classify_known_journals() {
        assert_eq!(classify("Nature"), JournalTier::Tier1);
        assert_eq!(classify("The Lancet"), JournalTier::Tier1);
        assert_eq!(classify("Nature Methods"), JournalTier::Tier2);
        assert_eq!(classify("eLife"), JournalTier::Tier2);
        assert_eq!(classify("NeurIPS"), JournalTier::Ml);
        assert_eq!(classify("bioRxiv"), JournalTier::Preprint);
        assert_eq!(classify("Journal of Obscure Results"), JournalTier::Unclassified);
    }

    #[test]
    fn classify_resolves_aliases_and_punctuation() {
        assert_eq!(classify("Nat. Methods"), JournalTier::Tier2);
        assert_eq!(classify("NEJM"), JournalTier::Tier1);
        assert_eq!(classify("PNAS"), JournalTier::Tier2);
        assert_eq!(classify("nat mach intell"), JournalTier::Ml);
    }

    #[test]
    fn classify_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(classify("Lancet"), JournalTier::Tier1);
        }
    }

    #[test]
    fn preprint_variants_match_as_substrings() {
        assert_eq!(classify("bioRxiv preprint"), JournalTier::Preprint);
        assert_eq!(classify("medRxiv"), JournalTier::Preprint);
        assert_eq!(classify("arXiv"), JournalTier::Preprint);
    }

    #[test]
    fn tier2_journal_excluded_when_only_tier1_configured() {
        let f = JournalFilter::from_config(&config(&[], &[], &["tier1"], true));
        assert!(!f.passes("Nature Methods", classify("Nature Methods")));
        assert!(f.passes("Nature", classify("Nature")));
    }

    #[test]
    fn include_list_admits_unclassified() {
        let f = JournalFilter::from_config(&config(
            &["Journal of Obscure Results"],
            &[],
            &["tier1"],
            false,
        ));
        let journal = "Journal of Obscure Results";
        assert!(f.passes(journal, classify(journal)));
        assert!(!f.passes("Another Unknown Venue", classify("Another Unknown Venue")));
    }

    #[test]
    fn exclude_wins_over_include_and_tiers() {
        let f = JournalFilter::from_config(&config(
            &["Nature"],
            &["Nature"],
            &["tier1"],
            true,
        ));
        assert!(!f.passes("Nature", classify("Nature")));
    }

    #[test]
    fn preprints_follow_show_preprints_flag() {
        let shown = JournalFilter::from_config(&config(&[], &[], &["tier1"], true));
        let hidden = JournalFilter::from_config(&config(&[], &[], &["tier1"], false));
        assert!(shown.passes("bioRxiv", JournalTier::Preprint));
        assert!(!hidden.passes("bioRxiv", JournalTier::Preprint));
    }
}
