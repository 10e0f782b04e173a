//! paperwatch-ingestion — Paper metadata ingestion.
//!
//! - Source adapters (PubMed, bioRxiv/medRxiv, arXiv)
//! - Bounded concurrent fan-out over adapters
//! - Deduplication into canonical-keyed records

pub mod dedup;
pub mod fetch;
pub mod sources;

pub use dedup::{dedup, DedupOutcome};
pub use fetch::{fetch_all, FetchOutcome, SourceFailure};
pub use sources::{adapters_from_config, SourceAdapter};
