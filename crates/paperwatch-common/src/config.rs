//! Configuration loading for Paperwatch.
//! Reads paperwatch.toml from the current directory or the path in the
//! PAPERWATCH_CONFIG env var. API keys may live in the file or in the
//! environment (PAPERWATCH_OPENAI_API_KEY, PAPERWATCH_NCBI_API_KEY).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{PaperwatchError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub journals: JournalsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub semantic: SemanticConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default query terms, OR-combined when no explicit query is given.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Source identifiers to query (pubmed, biorxiv, arxiv, medrxiv).
    #[serde(default = "default_databases")]
    pub databases: Vec<String>,
    #[serde(default = "default_days_back")]
    pub days_back: u32,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// NCBI API key for higher PubMed rate limits.
    #[serde(default)]
    pub ncbi_api_key: String,
}

fn default_databases() -> Vec<String> {
    vec!["pubmed".to_string(), "biorxiv".to_string(), "arxiv".to_string()]
}
fn default_days_back()   -> u32   { 1 }
fn default_max_results() -> usize { 100 }

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keywords: Vec::new(),
            databases: default_databases(),
            days_back: default_days_back(),
            max_results: default_max_results(),
            ncbi_api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalsConfig {
    /// Exact journal names always allowed through the filter.
    #[serde(default)]
    pub include: Vec<String>,
    /// Exact journal names never allowed through; exclude always wins.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Tier names (tier1, tier2, ml) whose journals pass the filter.
    #[serde(default)]
    pub tiers: Vec<String>,
    #[serde(default = "default_true")]
    pub show_preprints: bool,
}

fn default_true() -> bool { true }

impl Default for JournalsConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            tiers: vec!["tier1".to_string(), "tier2".to_string(), "ml".to_string()],
            show_preprints: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Base URL for openai_compatible and ollama providers.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_filtering_prompt")]
    pub filtering_prompt: String,
    /// Papers scoring below this are dropped from the digest ([0, 1]).
    #[serde(default)]
    pub min_score: f32,
    #[serde(default = "default_llm_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_provider() -> String { "openai".to_string() }
fn default_model()    -> String { "gpt-4o-mini".to_string() }
fn default_filtering_prompt() -> String {
    "You are a research assistant helping filter scientific papers. \
     Rate each paper's relevance from 0-100 and provide a brief explanation. \
     Consider: methodology novelty, dataset quality, and practical applications."
        .to_string()
}
fn default_llm_concurrency() -> usize { 4 }
fn default_max_retries()     -> u32   { 3 }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key: String::new(),
            filtering_prompt: default_filtering_prompt(),
            min_score: 0.0,
            max_concurrency: default_llm_concurrency(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmConfig {
    /// API key from config, falling back to the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var("PAPERWATCH_OPENAI_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Similarity threshold for subscription relevance.
    #[serde(default = "default_semantic_threshold")]
    pub threshold: f32,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

fn default_semantic_threshold() -> f32 { 0.5 }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_semantic_threshold(),
            model: default_embedding_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Freshness window: papers digested within this many days are
    /// suppressed, and history/cache rows older than it are pruned.
    #[serde(default = "default_cache_days")]
    pub cache_days: u32,
}

fn default_database_path() -> String { "papers.db".to_string() }
fn default_cache_days()    -> u32    { 30 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            cache_days: default_cache_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Maximum papers in one digest.
    #[serde(default = "default_digest_limit")]
    pub limit: usize,
}

fn default_digest_limit() -> usize { 20 }

impl Default for DigestConfig {
    fn default() -> Self {
        Self { limit: default_digest_limit() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Whole-run deadline. On expiry in-flight fetch/scoring is cancelled
    /// and the digest is built from whatever completed.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    /// How many source adapters may fetch at once.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

fn default_deadline_secs()     -> u64   { 300 }
fn default_fetch_concurrency() -> usize { 4 }

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            deadline_secs: default_deadline_secs(),
            fetch_concurrency: default_fetch_concurrency(),
        }
    }
}

impl Config {
    /// Load from an explicit path.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let _ = dotenvy::dotenv();
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PaperwatchError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| PaperwatchError::Config(format!("invalid TOML: {e}")))?;
        Ok(config)
    }

    /// Load from PAPERWATCH_CONFIG or ./paperwatch.toml.
    pub fn load_default() -> Result<Config> {
        let path = std::env::var("PAPERWATCH_CONFIG")
            .unwrap_or_else(|_| "paperwatch.toml".to_string());
        Self::load(path)
    }

    /// Validate the configuration; returns human-readable problems.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.search.keywords.is_empty() {
            errors.push("search.keywords is empty; digest runs would match nothing".to_string());
        }
        for db in &self.search.databases {
            if !matches!(db.as_str(), "pubmed" | "biorxiv" | "arxiv" | "medrxiv") {
                errors.push(format!("unknown source in search.databases: {db}"));
            }
        }
        for tier in &self.journals.tiers {
            if crate::models::JournalTier::parse(tier).is_none() {
                errors.push(format!("unknown tier in journals.tiers: {tier}"));
            }
        }
        match self.llm.provider.as_str() {
            "openai" => {
                if self.llm.resolved_api_key().is_none() {
                    errors.push(
                        "llm.provider is openai but no API key configured \
                         (set llm.api_key or PAPERWATCH_OPENAI_API_KEY)"
                            .to_string(),
                    );
                }
            }
            "openai_compatible" => {
                if self.llm.base_url.as_deref().unwrap_or("").is_empty() {
                    errors.push("llm.provider is openai_compatible but llm.base_url is not set".to_string());
                }
            }
            // Ollama falls back to http://localhost:11434 when base_url is unset.
            "ollama" => {}
            other => errors.push(format!("unknown llm.provider: {other}")),
        }
        if !(0.0..=1.0).contains(&self.llm.min_score) {
            errors.push("llm.min_score must be in [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&self.semantic.threshold) {
            errors.push("semantic.threshold must be in [0, 1]".to_string());
        }

        errors
    }
}
