//! LLM relevance scoring with caching, single-flight and bounded retry.
//!
//! Each paper is scored at most once per run: concurrent requests for the
//! same key collapse onto one in-flight call, and a persistent cache keyed
//! by (canonical key, prompt hash) avoids re-scoring across runs as long as
//! the filtering prompt is unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell, Semaphore};
use tracing::{debug, warn};

use crate::backend::{LlmBackend, LlmRequest, Message};
use paperwatch_common::{CanonicalKey, PaperRecord};

/// A successful (or degraded) scoring result. Scores are normalized to
/// [0, 1] regardless of what the model answered.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreResult {
    pub score: f32,
    pub explanation: String,
}

/// Outcome of scoring one paper. `Failed` means the backend stayed
/// unreachable through all retries; the paper keeps no score and ranking
/// falls back to its other signals.
#[derive(Debug, Clone, PartialEq)]
pub enum ScoreOutcome {
    Scored(ScoreResult),
    Failed,
}

/// Persistent score cache seam, implemented by the store. Keyed by the
/// paper's canonical key plus a hash of the filtering prompt so prompt
/// edits invalidate old entries.
#[async_trait]
pub trait ScoreCache: Send + Sync {
    async fn get(
        &self,
        key: &CanonicalKey,
        prompt_hash: &str,
    ) -> paperwatch_common::Result<Option<ScoreResult>>;

    async fn put(
        &self,
        key: &CanonicalKey,
        prompt_hash: &str,
        result: &ScoreResult,
    ) -> paperwatch_common::Result<()>;
}

pub struct RelevanceScorer {
    backend: Arc<dyn LlmBackend>,
    cache: Option<Arc<dyn ScoreCache>>,
    filtering_prompt: String,
    prompt_hash: String,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    inflight: Mutex<HashMap<CanonicalKey, Arc<OnceCell<ScoreOutcome>>>>,
}

impl RelevanceScorer {
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        cache: Option<Arc<dyn ScoreCache>>,
        filtering_prompt: impl Into<String>,
        max_concurrency: usize,
        max_retries: u32,
    ) -> Self {
        let filtering_prompt = filtering_prompt.into();
        let prompt_hash = format!("{:x}", Sha256::digest(filtering_prompt.as_bytes()));
        Self {
            backend,
            cache,
            filtering_prompt,
            prompt_hash,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_retries,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn prompt_hash(&self) -> &str {
        &self.prompt_hash
    }

    /// Score one paper. Transient backend errors are retried with backoff;
    /// a malformed or non-transiently-failing response degrades to a zero
    /// score rather than aborting the run.
    pub async fn score(
        &self,
        key: &CanonicalKey,
        paper: &PaperRecord,
    ) -> paperwatch_common::Result<ScoreOutcome> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(key, &self.prompt_hash).await? {
                debug!(key = key.as_str(), "Score cache hit");
                return Ok(ScoreOutcome::Scored(hit));
            }
        }

        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight.entry(key.clone()).or_default().clone()
        };

        let outcome = cell
            .get_or_init(|| self.score_uncached(key, paper))
            .await
            .clone();
        Ok(outcome)
    }

    /// Score without consulting the cache. Only genuinely parsed scores are
    /// written back; degraded zeros and `Failed` stay uncached so a later
    /// run re-asks the model.
    async fn score_uncached(&self, key: &CanonicalKey, paper: &PaperRecord) -> ScoreOutcome {
        let request = self.build_request(paper);
        let mut attempt = 0u32;
        loop {
            // Hold the permit only for the provider call itself.
            let response = {
                let _permit = self.semaphore.acquire().await;
                self.backend.complete(request.clone()).await
            };
            match response {
                Ok(resp) => {
                    return match parse_score_response(&resp.content) {
                        Some(result) => {
                            self.cache_put(key, &result).await;
                            ScoreOutcome::Scored(result)
                        }
                        None => {
                            warn!(key = key.as_str(), "Unparseable score response, degrading");
                            ScoreOutcome::Scored(degraded())
                        }
                    };
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = retry_backoff(attempt);
                    warn!(key = key.as_str(), attempt, error = %e, "Scoring retry");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) if e.is_transient() => {
                    warn!(key = key.as_str(), error = %e, "Scoring failed after retries");
                    return ScoreOutcome::Failed;
                }
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "Non-transient scoring error, degrading");
                    return ScoreOutcome::Scored(degraded());
                }
            }
        }
    }

    /// Best-effort cache write; a failure costs a re-score next run, not
    /// the run itself.
    async fn cache_put(&self, key: &CanonicalKey, result: &ScoreResult) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, &self.prompt_hash, result).await {
                warn!(key = key.as_str(), error = %e, "Score cache write failed");
            }
        }
    }

    fn build_request(&self, paper: &PaperRecord) -> LlmRequest {
        let user = format!(
            "Title: {}\nJournal: {}\nAbstract: {}\n\n\
             Respond with JSON only: {{\"score\": <0-100>, \"explanation\": \"<one sentence>\"}}",
            paper.title, paper.journal, paper.abstract_text
        );
        LlmRequest {
            messages: vec![
                Message { role: "system".to_string(), content: self.filtering_prompt.clone() },
                Message { role: "user".to_string(), content: user },
            ],
            max_tokens: Some(200),
            temperature: Some(0.0),
        }
    }
}

fn degraded() -> ScoreResult {
    ScoreResult { score: 0.0, explanation: "scoring failed".to_string() }
}

/// 500ms * 2^attempt plus up to 250ms of jitter.
fn retry_backoff(attempt: u32) -> Duration {
    let base = Duration::from_millis(500) * 2u32.pow(attempt.min(6));
    base + Duration::from_millis(rand::thread_rng().gen_range(0..250))
}

/// Pull `{"score": .., "explanation": ".."}` out of the model output, which
/// may wrap the JSON in prose or code fences. Scores arrive on a 0-100
/// scale and are normalized to [0, 1].
fn parse_score_response(content: &str) -> Option<ScoreResult> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    let json: serde_json::Value = serde_json::from_str(&content[start..=end]).ok()?;
    let raw = json.get("score")?.as_f64()?;
    let explanation = json
        .get("explanation")
        .and_then(|e| e.as_str())
        .unwrap_or("")
        .to_string();
    Some(ScoreResult {
        score: ((raw / 100.0) as f32).clamp(0.0, 1.0),
        explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LlmError, LlmResponse};
    use paperwatch_common::SourceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn paper(title: &str) -> PaperRecord {
        PaperRecord {
            doi: Some(format!("10.1/{}", title.to_lowercase().replace(' ', "-"))),
            title: title.to_string(),
            abstract_text: "An abstract.".to_string(),
            authors: vec!["Jane Smith".to_string()],
            journal: "Nature".to_string(),
            published: None,
            source: SourceId::PubMed,
            url: String::new(),
        }
    }

    fn key_of(p: &PaperRecord) -> CanonicalKey {
        CanonicalKey::for_record(p).unwrap()
    }

    struct FakeBackend {
        calls: AtomicU32,
        fail_first: u32,
        transient: bool,
        reply: String,
    }

    impl FakeBackend {
        fn replying(reply: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: 0,
                transient: true,
                reply: reply.to_string(),
            }
        }

        fn failing_first(n: u32, transient: bool, reply: &str) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first: n,
                transient,
                reply: reply.to_string(),
            }
        }
    }

    #[async_trait]
    impl LlmBackend for FakeBackend {
        async fn complete(&self, _req: LlmRequest) -> Result<LlmResponse, LlmError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(if self.transient {
                    LlmError::RateLimitExceeded
                } else {
                    LlmError::ApiError { status: 400, message: "bad request".into() }
                });
            }
            Ok(LlmResponse { content: self.reply.clone(), model: "fake".to_string() })
        }

        async fn embed(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError> {
            Ok(vec![])
        }

        fn model_id(&self) -> &str { "fake" }
        fn is_local(&self) -> bool { true }
    }

    fn scorer(backend: Arc<FakeBackend>) -> RelevanceScorer {
        RelevanceScorer::new(backend, None, "Rate papers.", 4, 2)
    }

    #[tokio::test]
    async fn score_is_normalized_from_percent() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"score": 85, "explanation": "novel method"}"#,
        ));
        let s = scorer(backend);
        let p = paper("CRISPR screens");
        let outcome = s.score(&key_of(&p), &p).await.unwrap();
        assert_eq!(
            outcome,
            ScoreOutcome::Scored(ScoreResult { score: 0.85, explanation: "novel method".into() })
        );
    }

    #[tokio::test]
    async fn json_embedded_in_prose_is_extracted() {
        let backend = Arc::new(FakeBackend::replying(
            "Sure! Here is my rating:\n```json\n{\"score\": 40, \"explanation\": \"ok\"}\n```",
        ));
        let s = scorer(backend);
        let p = paper("A paper");
        match s.score(&key_of(&p), &p).await.unwrap() {
            ScoreOutcome::Scored(r) => assert!((r.score - 0.4).abs() < 1e-6),
            ScoreOutcome::Failed => panic!("expected a score"),
        }
    }

    #[tokio::test]
    async fn malformed_response_degrades_to_zero() {
        let backend = Arc::new(FakeBackend::replying("I cannot rate this paper."));
        let s = scorer(backend.clone());
        let p = paper("A paper");
        let outcome = s.score(&key_of(&p), &p).await.unwrap();
        assert_eq!(
            outcome,
            ScoreOutcome::Scored(ScoreResult { score: 0.0, explanation: "scoring failed".into() })
        );
        // Malformed output is not a transport error; no retry.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_error_is_retried_then_succeeds() {
        let backend = Arc::new(FakeBackend::failing_first(
            1,
            true,
            r#"{"score": 60, "explanation": "fine"}"#,
        ));
        let s = scorer(backend.clone());
        let p = paper("A paper");
        let outcome = s.score(&key_of(&p), &p).await.unwrap();
        assert!(matches!(outcome, ScoreOutcome::Scored(r) if (r.score - 0.6).abs() < 1e-6));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_yield_failed_not_zero() {
        let backend = Arc::new(FakeBackend::failing_first(u32::MAX, true, ""));
        let s = scorer(backend.clone());
        let p = paper("A paper");
        let outcome = s.score(&key_of(&p), &p).await.unwrap();
        assert_eq!(outcome, ScoreOutcome::Failed);
        // Initial attempt plus max_retries.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_degrades_without_retry() {
        let backend = Arc::new(FakeBackend::failing_first(u32::MAX, false, ""));
        let s = scorer(backend.clone());
        let p = paper("A paper");
        let outcome = s.score(&key_of(&p), &p).await.unwrap();
        assert!(matches!(outcome, ScoreOutcome::Scored(r) if r.score == 0.0));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_scores_for_same_key_collapse_to_one_call() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"score": 70, "explanation": "x"}"#,
        ));
        let s = Arc::new(scorer(backend.clone()));
        let p = paper("Shared paper");
        let key = key_of(&p);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            let p = p.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { s.score(&key, &p).await }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(matches!(outcome, ScoreOutcome::Scored(_)));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    struct MemoryCache {
        entries: Mutex<HashMap<(String, String), ScoreResult>>,
        gets: AtomicU32,
        puts: AtomicU32,
    }

    impl MemoryCache {
        fn new() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
                gets: AtomicU32::new(0),
                puts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ScoreCache for MemoryCache {
        async fn get(
            &self,
            key: &CanonicalKey,
            prompt_hash: &str,
        ) -> paperwatch_common::Result<Option<ScoreResult>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            let entries = self.entries.lock().await;
            Ok(entries.get(&(key.as_str().to_string(), prompt_hash.to_string())).cloned())
        }

        async fn put(
            &self,
            key: &CanonicalKey,
            prompt_hash: &str,
            result: &ScoreResult,
        ) -> paperwatch_common::Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            let mut entries = self.entries.lock().await;
            entries.insert(
                (key.as_str().to_string(), prompt_hash.to_string()),
                result.clone(),
            );
            Ok(())
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_the_backend() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"score": 90, "explanation": "great"}"#,
        ));
        let cache = Arc::new(MemoryCache::new());
        let s = RelevanceScorer::new(backend.clone(), Some(cache.clone()), "Rate.", 4, 2);
        let p = paper("Cached paper");
        let key = key_of(&p);

        s.score(&key, &p).await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);

        // Second scorer instance simulates a later run sharing the cache.
        let s2 = RelevanceScorer::new(backend.clone(), Some(cache.clone()), "Rate.", 4, 2);
        let outcome = s2.score(&key, &p).await.unwrap();
        assert!(matches!(outcome, ScoreOutcome::Scored(r) if (r.score - 0.9).abs() < 1e-6));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn degraded_result_is_not_cached_and_is_rescored_later() {
        let cache = Arc::new(MemoryCache::new());
        let p = paper("Garbled paper");
        let key = key_of(&p);

        let garbled = Arc::new(FakeBackend::replying("no json here"));
        let s = RelevanceScorer::new(garbled, Some(cache.clone()), "Rate.", 4, 2);
        let outcome = s.score(&key, &p).await.unwrap();
        assert!(matches!(outcome, ScoreOutcome::Scored(r) if r.score == 0.0));
        assert_eq!(cache.puts.load(Ordering::SeqCst), 0);

        // A later run with a healthy backend asks the model again instead of
        // serving the degraded zero.
        let healthy = Arc::new(FakeBackend::replying(
            r#"{"score": 80, "explanation": "good"}"#,
        ));
        let s2 = RelevanceScorer::new(healthy.clone(), Some(cache.clone()), "Rate.", 4, 2);
        let outcome = s2.score(&key, &p).await.unwrap();
        assert!(matches!(outcome, ScoreOutcome::Scored(r) if (r.score - 0.8).abs() < 1e-6));
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn collapsed_waiters_share_one_cache_write() {
        let backend = Arc::new(FakeBackend::replying(
            r#"{"score": 70, "explanation": "x"}"#,
        ));
        let cache = Arc::new(MemoryCache::new());
        let s = Arc::new(RelevanceScorer::new(
            backend.clone(),
            Some(cache.clone()),
            "Rate.",
            4,
            2,
        ));
        let p = paper("Shared paper");
        let key = key_of(&p);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            let p = p.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { s.score(&key, &p).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prompt_hash_differs_per_prompt() {
        let backend = Arc::new(FakeBackend::replying(""));
        let a = RelevanceScorer::new(backend.clone(), None, "prompt one", 1, 0);
        let b = RelevanceScorer::new(backend, None, "prompt two", 1, 0);
        assert_ne!(a.prompt_hash(), b.prompt_hash());
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let r = parse_score_response(r#"{"score": 150, "explanation": "x"}"#).unwrap();
        assert_eq!(r.score, 1.0);
        let r = parse_score_response(r#"{"score": -5, "explanation": "x"}"#).unwrap();
        assert_eq!(r.score, 0.0);
    }
}
