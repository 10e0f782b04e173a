//! Embedding-based semantic matching.
//!
//! Paper embeddings are batched per run and cached by canonical key so a
//! paper is embedded once no matter how many queries or subscriptions it
//! is compared against.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::backend::{LlmBackend, LlmError};
use paperwatch_common::{CanonicalKey, PaperRecord};

pub struct SemanticMatcher {
    backend: Arc<dyn LlmBackend>,
    threshold: f32,
    embeddings: Mutex<HashMap<CanonicalKey, Vec<f32>>>,
}

impl SemanticMatcher {
    pub fn new(backend: Arc<dyn LlmBackend>, threshold: f32) -> Self {
        Self {
            backend,
            threshold,
            embeddings: Mutex::new(HashMap::new()),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn is_relevant(&self, score: f32) -> bool {
        score >= self.threshold
    }

    /// Similarity of each paper to `query`, in input order. Papers already
    /// embedded this run are served from the per-run cache; the rest go to
    /// the backend in one batch.
    pub async fn similarities(
        &self,
        query: &str,
        papers: &[(CanonicalKey, &PaperRecord)],
    ) -> Result<Vec<f32>, LlmError> {
        let query_embedding = self
            .backend
            .embed(vec![query.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Unavailable("empty embedding response".to_string()))?;

        self.ensure_embedded(papers).await?;

        let embeddings = self.embeddings.lock().await;
        Ok(papers
            .iter()
            .map(|(key, _)| {
                embeddings
                    .get(key)
                    .map(|e| cosine_similarity(&query_embedding, e))
                    .unwrap_or(0.0)
            })
            .collect())
    }

    async fn ensure_embedded(
        &self,
        papers: &[(CanonicalKey, &PaperRecord)],
    ) -> Result<(), LlmError> {
        let missing: Vec<(CanonicalKey, String)> = {
            let embeddings = self.embeddings.lock().await;
            papers
                .iter()
                .filter(|(key, _)| !embeddings.contains_key(key))
                .map(|(key, paper)| (key.clone(), paper.match_text()))
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = missing.iter().map(|(_, t)| t.clone()).collect();
        let vectors = self.backend.embed(texts).await?;
        if vectors.len() != missing.len() {
            return Err(LlmError::Unavailable(format!(
                "embedding count mismatch: asked {}, got {}",
                missing.len(),
                vectors.len()
            )));
        }

        let mut embeddings = self.embeddings.lock().await;
        for ((key, _), vector) in missing.into_iter().zip(vectors) {
            embeddings.insert(key, vector);
        }
        Ok(())
    }
}

/// Cosine similarity clamped to [0, 1]; zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LlmRequest, LlmResponse};
    use async_trait::async_trait;
    use paperwatch_common::SourceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -0.2, 0.8];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn opposite_vectors_clamp_to_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
    }

    #[test]
    fn mismatched_or_zero_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    struct CountingEmbedder {
        calls: AtomicU32,
        texts_embedded: AtomicU32,
    }

    #[async_trait]
    impl LlmBackend for CountingEmbedder {
        async fn complete(&self, _req: LlmRequest) -> Result<LlmResponse, LlmError> {
            Err(LlmError::Unavailable("completions unsupported".to_string()))
        }

        async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_embedded.fetch_add(texts.len() as u32, Ordering::SeqCst);
            // Deterministic per-text vector keyed off length.
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.0])
                .collect())
        }

        fn model_id(&self) -> &str { "fake-embedder" }
        fn is_local(&self) -> bool { true }
    }

    fn paper(title: &str) -> PaperRecord {
        PaperRecord {
            doi: Some(format!("10.1/{}", title.to_lowercase().replace(' ', "-"))),
            title: title.to_string(),
            abstract_text: "text".to_string(),
            authors: vec![],
            journal: "Nature".to_string(),
            published: None,
            source: SourceId::PubMed,
            url: String::new(),
        }
    }

    #[tokio::test]
    async fn papers_are_embedded_once_per_run() {
        let backend = Arc::new(CountingEmbedder {
            calls: AtomicU32::new(0),
            texts_embedded: AtomicU32::new(0),
        });
        let matcher = SemanticMatcher::new(backend.clone(), 0.5);

        let p1 = paper("First paper");
        let p2 = paper("Second paper");
        let k1 = CanonicalKey::for_record(&p1).unwrap();
        let k2 = CanonicalKey::for_record(&p2).unwrap();
        let papers = vec![(k1, &p1), (k2, &p2)];

        let scores = matcher.similarities("query one", &papers).await.unwrap();
        assert_eq!(scores.len(), 2);

        matcher.similarities("query two", &papers).await.unwrap();

        // 2 query embeddings + 1 paper batch; papers not re-embedded.
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
        assert_eq!(backend.texts_embedded.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn threshold_gates_relevance() {
        let backend = Arc::new(CountingEmbedder {
            calls: AtomicU32::new(0),
            texts_embedded: AtomicU32::new(0),
        });
        let matcher = SemanticMatcher::new(backend, 0.7);
        assert!(matcher.is_relevant(0.7));
        assert!(matcher.is_relevant(0.9));
        assert!(!matcher.is_relevant(0.69));
    }
}
