//! In-memory [`VectorIndex`] and [`KeywordIndex`] implementations.
//!
//! Records live in a `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity; keyword search counts the query terms
//! each readable chunk contains, typos included. Used by tests and by the assistant
//! when no database is configured.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::embedding::cosine_similarity;
use crate::keyword;
use crate::models::{Acl, Chunk, EmbeddedChunk, IndexFilters, InferenceChunk, SearchType};

use super::{
    chunk_uuid, coherent_acl, embedding_uuid, group_by_document, net_new_documents,
    plan_document_write, KeywordIndex, VectorHit, VectorIndex,
};

#[derive(Clone)]
struct VectorRecord {
    uuid: Uuid,
    parent_uuid: Uuid,
    chunk: Chunk,
    acl: Acl,
    embedding: Vec<f32>,
}

/// Brute-force vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: RwLock<Vec<VectorRecord>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored vector records, mini-chunks included.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ACLs of every stored record of `document_id`.
    pub fn acls_for_document(&self, document_id: &str) -> Vec<Acl> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.chunk.document_id == document_id)
            .map(|r| r.acl.clone())
            .collect()
    }

    /// Record UUIDs in storage order.
    pub fn uuids(&self) -> Vec<Uuid> {
        self.records.read().unwrap().iter().map(|r| r.uuid).collect()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn index(&self, chunks: &[EmbeddedChunk], user_id: Option<&str>) -> Result<usize> {
        let groups = group_by_document(chunks, |c| c.chunk.document_id.as_str());
        let mut records = self.records.write().unwrap();

        let mut writes = Vec::with_capacity(groups.len());
        for (document_id, items) in groups {
            let stored: Vec<Acl> = records
                .iter()
                .filter(|r| r.chunk.document_id == document_id)
                .map(|r| r.acl.clone())
                .collect();
            let existing = coherent_acl(&document_id, stored)?;
            writes.push(plan_document_write(document_id, items, existing, user_id));
        }

        for write in &writes {
            if write.replaces_existing {
                records.retain(|r| r.chunk.document_id != write.document_id);
            }
            for embedded in &write.items {
                let chunk = &embedded.chunk;
                let parent_uuid = chunk_uuid(&chunk.document_id, chunk.chunk_id, None);
                for (i, vector) in embedded.embeddings.iter().enumerate() {
                    let record = VectorRecord {
                        uuid: embedding_uuid(&chunk.document_id, chunk.chunk_id, i),
                        parent_uuid,
                        chunk: chunk.clone(),
                        acl: write.acl.clone(),
                        embedding: vector.clone(),
                    };
                    match records.iter_mut().find(|r| r.uuid == record.uuid) {
                        Some(slot) => *slot = record,
                        None => records.push(record),
                    }
                }
            }
        }

        Ok(net_new_documents(&writes))
    }

    async fn search_page(
        &self,
        query_vec: &[f32],
        user_id: Option<&str>,
        filters: &IndexFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VectorHit>> {
        filters.validate()?;
        let records = self.records.read().unwrap();
        let mut scored: Vec<(f64, &VectorRecord)> = records
            .iter()
            .filter(|r| r.acl.permits(user_id))
            .filter(|r| filters.matches(r.chunk.source_type, &r.chunk.document_id))
            .map(|r| (cosine_similarity(query_vec, &r.embedding) as f64, r))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(score, r)| VectorHit {
                parent_uuid: r.parent_uuid,
                chunk: InferenceChunk::from_chunk(&r.chunk, SearchType::Semantic, Some(score)),
            })
            .collect())
    }
}

#[derive(Clone)]
struct KeywordRecord {
    uuid: Uuid,
    chunk: Chunk,
    acl: Acl,
}

/// Linear-scan keyword index.
#[derive(Default)]
pub struct InMemoryKeywordIndex {
    records: RwLock<Vec<KeywordRecord>>,
}

impl InMemoryKeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn acls_for_document(&self, document_id: &str) -> Vec<Acl> {
        self.records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.chunk.document_id == document_id)
            .map(|r| r.acl.clone())
            .collect()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.records.read().unwrap().iter().map(|r| r.uuid).collect()
    }
}

#[async_trait]
impl KeywordIndex for InMemoryKeywordIndex {
    async fn index(&self, chunks: &[Chunk], user_id: Option<&str>) -> Result<usize> {
        let groups = group_by_document(chunks, |c| c.document_id.as_str());
        let mut records = self.records.write().unwrap();

        let mut writes = Vec::with_capacity(groups.len());
        for (document_id, items) in groups {
            let stored: Vec<Acl> = records
                .iter()
                .filter(|r| r.chunk.document_id == document_id)
                .map(|r| r.acl.clone())
                .collect();
            let existing = coherent_acl(&document_id, stored)?;
            writes.push(plan_document_write(document_id, items, existing, user_id));
        }

        for write in &writes {
            if write.replaces_existing {
                records.retain(|r| r.chunk.document_id != write.document_id);
            }
            for chunk in &write.items {
                let record = KeywordRecord {
                    uuid: chunk_uuid(&chunk.document_id, chunk.chunk_id, None),
                    chunk: (*chunk).clone(),
                    acl: write.acl.clone(),
                };
                match records.iter_mut().find(|r| r.uuid == record.uuid) {
                    Some(slot) => *slot = record,
                    None => records.push(record),
                }
            }
        }

        Ok(net_new_documents(&writes))
    }

    async fn keyword_search(
        &self,
        query: &str,
        user_id: Option<&str>,
        filters: &IndexFilters,
        num_to_retrieve: usize,
    ) -> Result<Vec<InferenceChunk>> {
        filters.validate()?;
        let mut seen = HashSet::new();
        let terms: Vec<&str> = query
            .split_whitespace()
            .filter(|t| seen.insert(*t))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.records.read().unwrap();
        let mut scored: Vec<(f64, &KeywordRecord)> = records
            .iter()
            .filter(|r| r.acl.permits(user_id))
            .filter(|r| filters.matches(r.chunk.source_type, &r.chunk.document_id))
            .map(|r| (match_score(&terms, &r.chunk), r))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(num_to_retrieve)
            .map(|(score, r)| InferenceChunk::from_chunk(&r.chunk, SearchType::Keyword, Some(score)))
            .collect())
    }
}

/// Query terms found in the chunk; identifier hits count
/// [`keyword::IDENTIFIER_WEIGHT`] times.
fn match_score(terms: &[&str], chunk: &Chunk) -> f64 {
    let title = keyword::tokenize(&chunk.semantic_identifier);
    let content = keyword::tokenize(&chunk.content);
    let found = |tokens: &[String], term: &str| {
        tokens
            .iter()
            .any(|t| t == term || keyword::is_typo_of(term, t))
    };

    terms
        .iter()
        .map(|term| {
            let mut score = 0.0;
            if found(&title, term) {
                score += keyword::IDENTIFIER_WEIGHT;
            }
            if found(&content, term) {
                score += 1.0;
            }
            score
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::error::CoreError;
    use crate::index::SEARCH_DISTANCE_CUTOFF;
    use crate::models::{DocumentSource, PUBLIC_ACL};
    use std::collections::BTreeMap;

    fn chunk(doc: &str, id: usize, content: &str) -> Chunk {
        let mut source_links = BTreeMap::new();
        source_links.insert(0, format!("https://{}", doc));
        Chunk {
            document_id: doc.to_string(),
            chunk_id: id,
            content: content.to_string(),
            blurb: content.chars().take(20).collect(),
            source_links,
            section_continuation: false,
            source_type: DocumentSource::Web,
            semantic_identifier: doc.to_string(),
            metadata: BTreeMap::new(),
            mini_chunks: Vec::new(),
        }
    }

    fn embed(chunks: &[Chunk]) -> Vec<EmbeddedChunk> {
        let e = HashingEmbedder::new(64);
        chunks
            .iter()
            .map(|c| {
                let mut embeddings = vec![e.embed_one(&c.content)];
                embeddings.extend(c.mini_chunks.iter().map(|m| e.embed_one(m)));
                EmbeddedChunk {
                    chunk: c.clone(),
                    embeddings,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent_and_net_zero() {
        let index = InMemoryVectorIndex::new();
        let chunks = vec![chunk("d1", 0, "Eiffel Tower Paris"), chunk("d1", 1, "France")];
        assert_eq!(index.index(&embed(&chunks), None).await.unwrap(), 1);
        let first = index.uuids();
        assert_eq!(index.index(&embed(&chunks), None).await.unwrap(), 0);
        assert_eq!(index.uuids(), first);
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_reindex_merges_acl_across_users() {
        let index = InMemoryKeywordIndex::new();
        let chunks = vec![chunk("d1", 0, "alpha"), chunk("d1", 1, "beta")];
        index.index(&chunks, Some("u1")).await.unwrap();
        index.index(&chunks, Some("u2")).await.unwrap();
        let acls = index.acls_for_document("d1");
        assert_eq!(acls.len(), 2);
        assert_eq!(acls[0], acls[1]);
        assert!(acls[0].allowed_users.contains("u1"));
        assert!(acls[0].allowed_users.contains("u2"));
        assert!(!acls[0].allowed_users.contains(PUBLIC_ACL));
    }

    #[tokio::test]
    async fn test_shrinking_document_removes_stale_chunks() {
        let index = InMemoryKeywordIndex::new();
        index
            .index(&[chunk("d1", 0, "a"), chunk("d1", 1, "b")], None)
            .await
            .unwrap();
        index.index(&[chunk("d1", 0, "a")], None).await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_acl_filtered_reads() {
        let index = InMemoryKeywordIndex::new();
        index
            .index(&[chunk("d1", 0, "The Eiffel Tower is in Paris")], Some("u2"))
            .await
            .unwrap();
        let filters = IndexFilters::default();
        let q = keyword::preprocess_query("Where is the Eiffel Tower?");
        assert!(index.keyword_search(&q, Some("u1"), &filters, 10).await.unwrap().is_empty());
        assert!(index.keyword_search(&q, None, &filters, 10).await.unwrap().is_empty());
        assert_eq!(index.keyword_search(&q, Some("u2"), &filters, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mini_chunks_collapse_to_parent() {
        let index = InMemoryVectorIndex::new();
        let mut parent = chunk("d1", 0, "tower tower tower bridge");
        parent.mini_chunks = vec!["tower tower".to_string(), "tower bridge".to_string()];
        let other = chunk("d2", 0, "tower river");
        index.index(&embed(&[parent, other]), None).await.unwrap();
        assert_eq!(index.len(), 4);

        let query = HashingEmbedder::new(64).embed_one("tower");
        let hits = index
            .semantic_retrieval(&query, None, &IndexFilters::default(), 10, SEARCH_DISTANCE_CUTOFF)
            .await
            .unwrap();
        let d1_hits = hits.iter().filter(|h| h.document_id == "d1").count();
        assert_eq!(d1_hits, 1);
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_semantic_retrieval_applies_cutoff() {
        let index = InMemoryVectorIndex::new();
        index
            .index(&embed(&[chunk("d1", 0, "quarterly revenue report")]), None)
            .await
            .unwrap();
        let query = HashingEmbedder::new(64).embed_one("mountain hiking");
        let hits = index
            .semantic_retrieval(&query, None, &IndexFilters::default(), 10, 0.99)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_rejected() {
        let index = InMemoryKeywordIndex::new();
        let filters = IndexFilters {
            source_types: Some(vec![]),
            document_ids: None,
        };
        let err = index.keyword_search("tower", None, &filters, 5).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_keyword_partial_match_and_ranking() {
        let index = InMemoryKeywordIndex::new();
        index
            .index(
                &[
                    chunk("d1", 0, "eiffel bridge"),
                    chunk("d2", 0, "eiffel tower paris"),
                    chunk("d3", 0, "unrelated text"),
                ],
                None,
            )
            .await
            .unwrap();
        let hits = index
            .keyword_search("eiffel tower", None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "d2");
        assert_eq!(hits[0].search_type, SearchType::Keyword);
    }

    #[tokio::test]
    async fn test_keyword_stopword_only_query_matches() {
        let index = InMemoryKeywordIndex::new();
        index
            .index(&[chunk("d1", 0, "what is it"), chunk("d2", 0, "tower")], None)
            .await
            .unwrap();
        let q = keyword::preprocess_query("what is it");
        let hits = index
            .keyword_search(&q, None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
    }

    #[tokio::test]
    async fn test_keyword_typo_and_identifier_weight() {
        let index = InMemoryKeywordIndex::new();
        let mut titled = chunk("d1", 0, "a guide to paris");
        titled.semantic_identifier = "Eiffel".to_string();
        index
            .index(&[chunk("d2", 0, "the eiffel tower"), titled], None)
            .await
            .unwrap();
        let hits = index
            .keyword_search("eifel", None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document_id, "d1");
    }
}
