//! paperwatch-filter — Boolean keyword queries and journal classification.

pub mod journal;
pub mod query;

pub use journal::{classify, JournalFilter};
pub use query::{QueryExpr, QuerySyntaxError};
