//! Deterministic digest ordering.
//!
//! Total order: llm score desc, then semantic score desc, then publication
//! date desc, then canonical key asc. Absent scores sort below any present
//! score, so when the scorer (or the embedder) was down for the whole run
//! the order degrades to the next signal without any special casing.

use std::cmp::Ordering;

use paperwatch_common::ScoredPaper;

/// Sort and assign `final_rank` (0-based). Input order never affects the
/// result.
pub fn rank(mut papers: Vec<ScoredPaper>) -> Vec<ScoredPaper> {
    papers.sort_by(compare);
    for (i, paper) in papers.iter_mut().enumerate() {
        paper.final_rank = i;
    }
    papers
}

fn compare(a: &ScoredPaper, b: &ScoredPaper) -> Ordering {
    score_desc(a.llm_score, b.llm_score)
        .then_with(|| score_desc(a.semantic_score, b.semantic_score))
        // Date descending; papers with no date sort last.
        .then_with(|| b.paper.published.cmp(&a.paper.published))
        .then_with(|| a.key.cmp(&b.key))
}

fn score_desc(a: Option<f32>, b: Option<f32>) -> Ordering {
    let a = a.unwrap_or(f32::NEG_INFINITY);
    let b = b.unwrap_or(f32::NEG_INFINITY);
    b.total_cmp(&a)
}
