//! paperwatch-store — SQLite persistence for digest history, subscriptions,
//! the LLM score cache and search history.
//!
//! All access goes through [`HistoryStore`], which owns one connection and
//! runs statements on the blocking pool so async pipeline stages never
//! stall on disk I/O.

pub mod store;

pub use store::{HistoryStore, PruneStats, SearchRecord};
