//! paperwatch-pipeline — the run coordinator and ranker.
//!
//! One [`pipeline::Pipeline`] drives the fetch → dedup → classify → filter →
//! score → rank → persist sequence and exposes the three entry points the
//! outer layers call: `run_digest`, `search` and `cleanup`.

pub mod pipeline;
pub mod ranker;

pub use pipeline::{Digest, Pipeline, StageReport, SubscriptionSection};
pub use ranker::rank;
