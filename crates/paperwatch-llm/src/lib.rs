//! paperwatch-llm — LLM-backed relevance scoring and semantic matching.
//!
//! Backends (one capability interface regardless of host):
//!   OpenAiBackend           — OpenAI API
//!   OpenAiCompatibleBackend — any OpenAI-compatible endpoint (vLLM, LMStudio, …)
//!   OllamaBackend           — local Ollama
//!
//! The [`scorer::RelevanceScorer`] wraps a backend with caching,
//! single-flight collapsing, bounded retry and a concurrency budget; the
//! [`semantic::SemanticMatcher`] adds embedding similarity.

pub mod backend;
pub mod scorer;
pub mod semantic;

pub use backend::{build_backend, LlmBackend, LlmError, LlmRequest, LlmResponse, Message};
pub use scorer::{RelevanceScorer, ScoreCache, ScoreOutcome, ScoreResult};
pub use semantic::SemanticMatcher;
