//! Indexing pipeline: chunk → keyword index → embed → vector index.
//!
//! Errors propagate to the caller (the connector runner records them on the
//! attempt). A failure between the two writes leaves the keyword index
//! ahead of the vector index; the next successful run replaces every
//! touched document in both, so the stores converge.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::chunk::{chunk_document, ChunkingParams};
use crate::embedding::{embed_chunks, EmbeddingProvider};
use crate::index::{KeywordIndex, VectorIndex};
use crate::models::{Chunk, Document};

/// Result of indexing one batch of documents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingOutcome {
    pub net_new_documents: usize,
    pub chunk_count: usize,
}

pub struct IndexingPipeline {
    chunking: ChunkingParams,
    embed_batch_size: usize,
    embedder: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorIndex>,
    keyword: Arc<dyn KeywordIndex>,
}

impl IndexingPipeline {
    pub fn new(
        chunking: ChunkingParams,
        embed_batch_size: usize,
        embedder: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorIndex>,
        keyword: Arc<dyn KeywordIndex>,
    ) -> Self {
        Self {
            chunking,
            embed_batch_size,
            embedder,
            vector,
            keyword,
        }
    }

    /// Index `documents` on behalf of `user_id` (`None` = public).
    ///
    /// Net new documents is the larger of the two indexes' counts; a
    /// disagreement is logged, not raised.
    pub async fn index(&self, documents: &[Document], user_id: Option<&str>) -> Result<IndexingOutcome> {
        let chunks: Vec<Chunk> = documents
            .iter()
            .flat_map(|doc| chunk_document(doc, &self.chunking))
            .collect();
        if chunks.is_empty() {
            return Ok(IndexingOutcome::default());
        }

        let net_keyword = self
            .keyword
            .index(&chunks, user_id)
            .await
            .context("keyword index write failed")?;

        let embedded = embed_chunks(self.embedder.as_ref(), &chunks, self.embed_batch_size)
            .await
            .context("embedding failed")?;

        let net_vector = self
            .vector
            .index(&embedded, user_id)
            .await
            .context("vector index write failed")?;

        if net_keyword != net_vector {
            warn!(
                keyword = net_keyword,
                vector = net_vector,
                "indexes disagree on net new documents"
            );
        }

        let outcome = IndexingOutcome {
            net_new_documents: net_keyword.max(net_vector),
            chunk_count: chunks.len(),
        };
        debug!(
            documents = documents.len(),
            chunks = outcome.chunk_count,
            net_new = outcome.net_new_documents,
            "indexed batch"
        );
        Ok(outcome)
    }
}
