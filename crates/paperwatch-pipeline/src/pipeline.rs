//! Pipeline coordinator.
//!
//! Drives one run through the stage sequence
//! fetch → dedup → classify → filter → score → rank → persist.
//! Stages only consume the previous stage's output; failures inside a stage
//! either degrade that stage (fetch, semantic, scoring) or abort the run
//! (persistence). The whole run observes a deadline: on expiry whatever
//! completed so far is ranked and emitted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};

use paperwatch_common::config::Config;
use paperwatch_common::{
    CanonicalKey, PaperRecord, Result, ScoredPaper, Subscription,
};
use paperwatch_filter::{classify, JournalFilter, QueryExpr};
use paperwatch_ingestion::{
    adapters_from_config, dedup, fetch_all, FetchOutcome, SourceAdapter, SourceFailure,
};
use paperwatch_llm::{
    build_backend, RelevanceScorer, ScoreCache, ScoreOutcome, SemanticMatcher,
};
use paperwatch_store::{HistoryStore, PruneStats};

/// Per-stage accounting for one run. Emitted with the digest so callers can
/// tell a genuinely empty result from a degraded one.
#[derive(Debug, Default)]
pub struct StageReport {
    pub fetched: usize,
    pub source_failures: Vec<SourceFailure>,
    pub skipped_malformed: usize,
    pub deduped: usize,
    pub filtered_out: usize,
    pub suppressed: usize,
    pub below_min_score: usize,
    /// At least one paper ended the run without an LLM score.
    pub scoring_degraded: bool,
    /// Embedding was unavailable; semantic scores are absent.
    pub semantic_degraded: bool,
    pub deadline_hit: bool,
}

/// Papers matching one subscription's keywords, in digest order.
#[derive(Debug)]
pub struct SubscriptionSection {
    pub subscription: Subscription,
    pub papers: Vec<ScoredPaper>,
}

/// The product of one run.
#[derive(Debug)]
pub struct Digest {
    pub papers: Vec<ScoredPaper>,
    pub sections: Vec<SubscriptionSection>,
    pub report: StageReport,
}

pub struct Pipeline {
    config: Config,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    scorer: Arc<RelevanceScorer>,
    semantic: Option<Arc<SemanticMatcher>>,
    store: Arc<HistoryStore>,
}

impl Pipeline {
    /// Wire the pipeline from configuration: backend, scorer (with the
    /// store as its persistent score cache), optional semantic matcher and
    /// the adapter set.
    pub fn new(config: Config, store: Arc<HistoryStore>) -> Result<Pipeline> {
        let backend = build_backend(&config.llm, &config.semantic.model)?;
        let scorer = Arc::new(RelevanceScorer::new(
            backend.clone(),
            Some(store.clone() as Arc<dyn ScoreCache>),
            config.llm.filtering_prompt.clone(),
            config.llm.max_concurrency,
            config.llm.max_retries,
        ));
        let semantic = config
            .semantic
            .enabled
            .then(|| Arc::new(SemanticMatcher::new(backend, config.semantic.threshold)));
        let adapters = adapters_from_config(&config.search);
        Ok(Pipeline { config, adapters, scorer, semantic, store })
    }

    /// Assemble from pre-built parts. Lets tests substitute fake adapters
    /// and backends without touching the network.
    pub fn with_parts(
        config: Config,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        scorer: Arc<RelevanceScorer>,
        semantic: Option<Arc<SemanticMatcher>>,
        store: Arc<HistoryStore>,
    ) -> Pipeline {
        Pipeline { config, adapters, scorer, semantic, store }
    }

    /// Scheduled digest run: default OR query over `search.keywords`,
    /// history suppression on, digest recorded in history.
    #[instrument(skip(self))]
    pub async fn run_digest(&self) -> Result<Digest> {
        let query = QueryExpr::any_of(&self.config.search.keywords);
        let keywords = self.config.search.keywords.clone();
        self.run(query, &keywords, true).await
    }

    /// On-demand search. Bypasses history suppression and leaves digest
    /// history untouched; the query itself is recorded.
    #[instrument(skip(self))]
    pub async fn search(&self, query_str: &str) -> Result<Digest> {
        let query = QueryExpr::parse(query_str)?;
        let keywords: Vec<String> = query
            .positive_literals()
            .into_iter()
            .map(String::from)
            .collect();
        let digest = self.run(Some(query), &keywords, false).await?;
        self.store
            .record_search(query_str.to_string(), digest.papers.len(), Utc::now())
            .await?;
        Ok(digest)
    }

    /// Remove history, cached scores and search records older than
    /// `older_than_days`. Subscriptions are kept.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, older_than_days: u32) -> Result<PruneStats> {
        let cutoff = Utc::now() - Duration::days(i64::from(older_than_days));
        self.store.prune(cutoff).await
    }

    async fn run(
        &self,
        query: Option<QueryExpr>,
        fetch_keywords: &[String],
        record_history: bool,
    ) -> Result<Digest> {
        let deadline =
            Instant::now() + std::time::Duration::from_secs(self.config.run.deadline_secs);
        let now = Utc::now();
        let mut report = StageReport::default();

        // Fetch.
        let since = now.date_naive() - Duration::days(i64::from(self.config.search.days_back));
        let fetched = match timeout_at(
            deadline,
            fetch_all(
                &self.adapters,
                fetch_keywords,
                since,
                self.config.search.max_results,
                self.config.run.fetch_concurrency,
            ),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Deadline expired during fetch");
                report.deadline_hit = true;
                FetchOutcome::default()
            }
        };
        report.fetched = fetched.records.len();
        report.source_failures = fetched.failures;

        // Dedup.
        let deduped = dedup(fetched.records);
        report.skipped_malformed = deduped.skipped;
        report.deduped = deduped.papers.len();

        // Classify + filter.
        let journal_filter = JournalFilter::from_config(&self.config.journals);
        let mut candidates: Vec<ScoredPaper> = Vec::new();
        for (key, paper) in deduped.papers {
            let tier = classify(&paper.journal);
            if !journal_filter.passes(&paper.journal, tier) {
                report.filtered_out += 1;
                continue;
            }
            let boolean_match = query
                .as_ref()
                .map(|q| q.matches(&paper.match_text()))
                .unwrap_or(true);
            if query.is_some() && !boolean_match {
                report.filtered_out += 1;
                continue;
            }
            candidates.push(ScoredPaper {
                paper,
                key,
                tier,
                boolean_match,
                semantic_score: None,
                llm_score: None,
                llm_explanation: None,
                final_rank: 0,
            });
        }

        // Freshness suppression (digest runs only).
        if record_history && !candidates.is_empty() {
            let cutoff = now - Duration::days(i64::from(self.config.storage.cache_days));
            let keys: Vec<CanonicalKey> = candidates.iter().map(|c| c.key.clone()).collect();
            let seen = self.store.seen_since(keys, cutoff).await?;
            let before = candidates.len();
            candidates.retain(|c| !seen.contains(&c.key));
            report.suppressed = before - candidates.len();
        }

        // Semantic similarity.
        if !candidates.is_empty() && !fetch_keywords.is_empty() {
            if let Some(matcher) = &self.semantic {
                let scores = {
                    let query_text = fetch_keywords.join(" ");
                    let refs: Vec<(CanonicalKey, &PaperRecord)> = candidates
                        .iter()
                        .map(|c| (c.key.clone(), &c.paper))
                        .collect();
                    match timeout_at(deadline, matcher.similarities(&query_text, &refs)).await {
                        Ok(Ok(scores)) => Some(scores),
                        Ok(Err(e)) => {
                            warn!(error = %e, "Embedding unavailable, skipping semantic stage");
                            report.semantic_degraded = true;
                            None
                        }
                        Err(_) => {
                            warn!("Deadline expired during semantic stage");
                            report.deadline_hit = true;
                            report.semantic_degraded = true;
                            None
                        }
                    }
                };
                if let Some(scores) = scores {
                    for (candidate, score) in candidates.iter_mut().zip(scores) {
                        candidate.semantic_score = Some(score);
                    }
                }
            }
        }

        // LLM scoring. Completed scores survive a deadline expiry; a store
        // read failure aborts the run.
        if !candidates.is_empty() {
            let scored: Arc<tokio::sync::Mutex<HashMap<CanonicalKey, ScoreOutcome>>> =
                Arc::default();
            let concurrency = self.config.llm.max_concurrency.max(1);
            let scoring = {
                let scored = scored.clone();
                let jobs: Vec<(CanonicalKey, PaperRecord)> = candidates
                    .iter()
                    .map(|c| (c.key.clone(), c.paper.clone()))
                    .collect();
                let scorer = self.scorer.clone();
                async move {
                    let results = stream::iter(jobs)
                        .map(|(key, paper)| {
                            let scorer = scorer.clone();
                            let scored = scored.clone();
                            async move {
                                let outcome = scorer.score(&key, &paper).await?;
                                scored.lock().await.insert(key, outcome);
                                Ok::<(), paperwatch_common::PaperwatchError>(())
                            }
                        })
                        .buffer_unordered(concurrency)
                        .collect::<Vec<_>>()
                        .await;
                    for result in results {
                        result?;
                    }
                    Ok::<(), paperwatch_common::PaperwatchError>(())
                }
            };
            match timeout_at(deadline, scoring).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    warn!("Deadline expired during scoring");
                    report.deadline_hit = true;
                }
            }

            let scored = scored.lock().await;
            for candidate in &mut candidates {
                match scored.get(&candidate.key) {
                    Some(ScoreOutcome::Scored(result)) => {
                        candidate.llm_score = Some(result.score);
                        candidate.llm_explanation = Some(result.explanation.clone());
                    }
                    Some(ScoreOutcome::Failed) | None => {
                        report.scoring_degraded = true;
                    }
                }
            }
        }

        // Min-score gate. Unscored papers pass through; they are already
        // flagged as degraded and rank by the fallback signals.
        let min_score = self.config.llm.min_score;
        if min_score > 0.0 {
            let before = candidates.len();
            candidates.retain(|c| c.llm_score.map(|s| s >= min_score).unwrap_or(true));
            report.below_min_score = before - candidates.len();
        }

        // Rank, then cut the digest prefix.
        let ranked = crate::ranker::rank(candidates);
        let limit = self.config.digest.limit;
        let papers: Vec<ScoredPaper> = ranked.iter().take(limit).cloned().collect();

        // Subscription sections, evaluated over the full ranked set. A paper
        // with a semantic score must also clear the relevance threshold.
        let mut sections = Vec::new();
        if record_history {
            for subscription in self.store.list_subscriptions().await? {
                let Some(sub_query) = QueryExpr::any_of(&subscription.keywords) else {
                    continue;
                };
                let matching: Vec<ScoredPaper> = ranked
                    .iter()
                    .filter(|p| sub_query.matches(&p.paper.match_text()))
                    .filter(|p| self.semantically_relevant(p))
                    .take(limit)
                    .cloned()
                    .collect();
                if !matching.is_empty() {
                    sections.push(SubscriptionSection { subscription, papers: matching });
                }
            }
        }

        // Persist. Section papers beyond the digest prefix were surfaced
        // too and must not re-appear next run.
        if record_history {
            let mut keys: HashSet<CanonicalKey> =
                papers.iter().map(|p| p.key.clone()).collect();
            for section in &sections {
                keys.extend(section.papers.iter().map(|p| p.key.clone()));
            }
            if !keys.is_empty() {
                self.store
                    .mark_digested(keys.into_iter().collect(), now)
                    .await?;
            }
        }

        info!(
            fetched = report.fetched,
            deduped = report.deduped,
            filtered_out = report.filtered_out,
            suppressed = report.suppressed,
            digest = papers.len(),
            sections = sections.len(),
            scoring_degraded = report.scoring_degraded,
            semantic_degraded = report.semantic_degraded,
            deadline_hit = report.deadline_hit,
            "Run complete"
        );

        Ok(Digest { papers, sections, report })
    }

    /// Papers without a semantic score (matcher disabled or the embedding
    /// stage degraded) pass; scored papers must meet the threshold.
    fn semantically_relevant(&self, paper: &ScoredPaper) -> bool {
        match (&self.semantic, paper.semantic_score) {
            (Some(matcher), Some(score)) => matcher.is_relevant(score),
            _ => true,
        }
    }
}
