//! paperwatch-common — Shared types, errors, and configuration used across
//! all Paperwatch crates.

pub mod config;
pub mod error;
pub mod models;

pub use error::{PaperwatchError, Result};
pub use models::{
    CanonicalKey, HistoryEntry, JournalTier, PaperRecord, ScoredPaper, SourceId, Subscription,
};
