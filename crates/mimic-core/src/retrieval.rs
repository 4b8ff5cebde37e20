//! Hybrid retrieval: concurrent vector + keyword search, reciprocal rank
//! fusion, and cross-encoder reranking.
//!
//! # Algorithm
//!
//! 1. Validate filters (an invalid filter is raised before any I/O).
//! 2. Embed the raw query and run the vector search; in parallel run the
//!    keyword search on the preprocessed query. Both futures are joined,
//!    so dropping the retrieval future cancels both.
//! 3. Both empty → `None`. Exactly one empty → use the other as-is.
//! 4. Otherwise fuse per document:
//!
//!    ```text
//!    score(d) = w · Σ 1/(rank_sem(d) + 1) + (1 − w) · Σ 1/(rank_kw(d) + 1)
//!    ```
//!
//!    with 0-based ranks. Ties keep first-appearance order (semantic list
//!    first). Each document is represented by its best-ranked chunk; the
//!    semantic chunk wins a rank tie.
//! 5. Cap at `num_returned_hits`, rerank the first `num_reranked_results`,
//!    and return `(reranked, remainder)`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::index::{KeywordIndex, VectorIndex, SEARCH_DISTANCE_CUTOFF};
use crate::keyword::preprocess_query;
use crate::models::{IndexFilters, InferenceChunk};

/// Cross-encoder relevance scoring.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `texts` against `query`. Returns `(original_index, score)`
    /// pairs for at most `top_n` texts, in any order.
    async fn rerank(&self, query: &str, texts: &[String], top_n: usize)
        -> Result<Vec<(usize, f64)>>;
}

/// Reranker that scores nothing, leaving the fused order untouched.
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, _texts: &[String], _top_n: usize) -> Result<Vec<(usize, f64)>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalParams {
    /// Cap on chunks returned (reranked + remainder).
    pub num_returned_hits: usize,
    /// How many fused chunks go to the reranker.
    pub num_reranked_results: usize,
    /// Weight `w` of the semantic list in RRF.
    pub rrf_weight: f64,
    pub distance_cutoff: f64,
    /// Each sub-search fetches `num_returned_hits * candidate_multiplier`
    /// chunks, since fusion collapses chunks per document.
    pub candidate_multiplier: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            num_returned_hits: 100,
            num_reranked_results: 15,
            rrf_weight: 0.5,
            distance_cutoff: SEARCH_DISTANCE_CUTOFF,
            candidate_multiplier: 2,
        }
    }
}

/// Ranked evidence for a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedChunks {
    pub reranked: Vec<InferenceChunk>,
    pub remainder: Vec<InferenceChunk>,
}

impl RetrievedChunks {
    /// Reranked chunks followed by the remainder.
    pub fn ranked(&self) -> impl Iterator<Item = &InferenceChunk> {
        self.reranked.iter().chain(self.remainder.iter())
    }

    pub fn len(&self) -> usize {
        self.reranked.len() + self.remainder.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorIndex>,
    keyword: Arc<dyn KeywordIndex>,
    reranker: Arc<dyn Reranker>,
    params: RetrievalParams,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<dyn KeywordIndex>,
        reranker: Arc<dyn Reranker>,
        params: RetrievalParams,
    ) -> Self {
        Self {
            embedder,
            vector,
            keyword,
            reranker,
            params,
        }
    }

    pub fn params(&self) -> &RetrievalParams {
        &self.params
    }

    /// Retrieve evidence readable by `user_id`. `Ok(None)` when neither
    /// index has a hit.
    pub async fn retrieve(
        &self,
        query: &str,
        user_id: Option<&str>,
        filters: &IndexFilters,
    ) -> Result<Option<RetrievedChunks>> {
        filters.validate()?;
        let candidates = self
            .params
            .num_returned_hits
            .saturating_mul(self.params.candidate_multiplier.max(1));
        let keyword_query = preprocess_query(query);

        let semantic = async {
            let query_vec = embed_query(self.embedder.as_ref(), query).await?;
            self.vector
                .semantic_retrieval(
                    &query_vec,
                    user_id,
                    filters,
                    candidates,
                    self.params.distance_cutoff,
                )
                .await
        };
        let lexical = self
            .keyword
            .keyword_search(&keyword_query, user_id, filters, candidates);

        let (semantic, lexical) = futures::try_join!(
            async { semantic.await.context("task 'semantic_search' failed") },
            async { lexical.await.context("task 'keyword_search' failed") },
        )?;
        debug!(
            semantic = semantic.len(),
            keyword = lexical.len(),
            "sub-searches complete"
        );

        let mut fused = match (semantic.is_empty(), lexical.is_empty()) {
            (true, true) => return Ok(None),
            (false, true) => semantic,
            (true, false) => lexical,
            (false, false) => reciprocal_rank_fusion(&semantic, &lexical, self.params.rrf_weight),
        };
        fused.truncate(self.params.num_returned_hits);

        let split = self.params.num_reranked_results.min(fused.len());
        let remainder = fused.split_off(split);
        let reranked = self.rerank(query, fused).await;

        Ok(Some(RetrievedChunks {
            reranked,
            remainder,
        }))
    }

    /// Reorder `top` by reranker score. Chunks the reranker did not score
    /// follow in fused order; a failing reranker leaves `top` unchanged.
    async fn rerank(&self, query: &str, top: Vec<InferenceChunk>) -> Vec<InferenceChunk> {
        if top.is_empty() {
            return top;
        }
        let texts: Vec<String> = top.iter().map(|c| c.content.clone()).collect();
        let mut scores = match self.reranker.rerank(query, &texts, top.len()).await {
            Ok(scores) => scores,
            Err(e) => {
                warn!(error = %e, "reranker failed, keeping fused order");
                return top;
            }
        };
        scores.retain(|(idx, _)| *idx < top.len());
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut slots: Vec<Option<InferenceChunk>> = top.into_iter().map(Some).collect();
        let mut reranked = Vec::with_capacity(slots.len());
        for (idx, score) in scores {
            if let Some(mut chunk) = slots[idx].take() {
                chunk.rerank_score = Some(score);
                reranked.push(chunk);
            }
        }
        reranked.extend(slots.into_iter().flatten());
        reranked
    }
}

struct FusedDocument<'a> {
    document_id: &'a str,
    score: f64,
    best_semantic: Option<usize>,
    best_keyword: Option<usize>,
}

/// Fuse two ranked lists per document with weighted reciprocal ranks.
pub fn reciprocal_rank_fusion(
    semantic: &[InferenceChunk],
    keyword: &[InferenceChunk],
    semantic_weight: f64,
) -> Vec<InferenceChunk> {
    let mut docs: Vec<FusedDocument<'_>> = Vec::new();

    fn entry<'a, 'b>(docs: &'b mut Vec<FusedDocument<'a>>, id: &'a str) -> &'b mut FusedDocument<'a> {
        let pos = match docs.iter().position(|d| d.document_id == id) {
            Some(pos) => pos,
            None => {
                docs.push(FusedDocument {
                    document_id: id,
                    score: 0.0,
                    best_semantic: None,
                    best_keyword: None,
                });
                docs.len() - 1
            }
        };
        &mut docs[pos]
    }

    for (rank, chunk) in semantic.iter().enumerate() {
        let doc = entry(&mut docs, &chunk.document_id);
        doc.score += semantic_weight / (rank as f64 + 1.0);
        doc.best_semantic.get_or_insert(rank);
    }
    for (rank, chunk) in keyword.iter().enumerate() {
        let doc = entry(&mut docs, &chunk.document_id);
        doc.score += (1.0 - semantic_weight) / (rank as f64 + 1.0);
        doc.best_keyword.get_or_insert(rank);
    }

    // Stable: equal scores keep first-appearance order.
    docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    docs.into_iter()
        .filter_map(|d| match (d.best_semantic, d.best_keyword) {
            (Some(s), Some(k)) if k < s => keyword.get(k),
            (Some(s), _) => semantic.get(s),
            (None, Some(k)) => keyword.get(k),
            (None, None) => None,
        })
        .cloned()
        .collect()
}
