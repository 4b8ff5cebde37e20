//! Vector and keyword index abstractions.
//!
//! Both indexes store chunks with an [`Acl`] payload and share one write
//! discipline, implemented by every backend through [`plan_document_write`]:
//!
//! 1. Group incoming chunks by document, in first-appearance order.
//! 2. Look up the stored ACL of each document ([`coherent_acl`] rejects a
//!    document whose stored chunks disagree).
//! 3. If the document exists, merge `allowed_users ∪ {user}` and delete
//!    every stored chunk of it.
//! 4. Upsert the new chunks with the resulting ACL, under stable UUIDs from
//!    [`chunk_uuid`] so re-runs overwrite instead of duplicating.
//!
//! `index` returns the net number of new documents: documents seen minus
//! documents that already existed.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{Acl, Chunk, EmbeddedChunk, IndexFilters, InferenceChunk};

/// Upserts are sent in batches of this many records.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Cosine similarity below which vector hits are dropped.
pub const SEARCH_DISTANCE_CUTOFF: f64 = 0.1;

/// Stable identifier of a stored chunk (or one of its mini-chunk vectors).
pub fn chunk_uuid(document_id: &str, chunk_id: usize, mini_index: Option<usize>) -> Uuid {
    let name = match mini_index {
        Some(mini) => format!("{}__{}__{}", document_id, chunk_id, mini),
        None => format!("{}__{}", document_id, chunk_id),
    };
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// UUID of the `i`-th embedding of a chunk: the parent for `i == 0`, a
/// mini-chunk sibling otherwise.
pub fn embedding_uuid(document_id: &str, chunk_id: usize, embedding_index: usize) -> Uuid {
    if embedding_index == 0 {
        chunk_uuid(document_id, chunk_id, None)
    } else {
        chunk_uuid(document_id, chunk_id, Some(embedding_index))
    }
}

/// Group items by document id, keeping first-appearance order of documents
/// and input order within each document.
pub fn group_by_document<'a, T>(
    items: &'a [T],
    document_id: impl Fn(&T) -> &str,
) -> Vec<(String, Vec<&'a T>)> {
    let mut groups: Vec<(String, Vec<&'a T>)> = Vec::new();
    for item in items {
        let id = document_id(item);
        match groups.iter_mut().find(|(gid, _)| gid == id) {
            Some((_, members)) => members.push(item),
            None => groups.push((id.to_string(), vec![item])),
        }
    }
    groups
}

/// Collapse the ACLs stored for one document into a single value.
///
/// Returns `None` for an unknown document and an index-corruption error if
/// stored chunks disagree.
pub fn coherent_acl(document_id: &str, stored: Vec<Acl>) -> Result<Option<Acl>, CoreError> {
    let mut iter = stored.into_iter();
    let first = match iter.next() {
        Some(acl) => acl,
        None => return Ok(None),
    };
    if iter.any(|acl| acl != first) {
        return Err(CoreError::corruption(
            document_id,
            "stored chunks carry different ACLs",
        ));
    }
    Ok(Some(first))
}

/// Write plan for one document.
#[derive(Debug)]
pub struct DocumentWrite<'a, T> {
    pub document_id: String,
    pub items: Vec<&'a T>,
    pub acl: Acl,
    /// The document already existed; its stored chunks must be deleted.
    pub replaces_existing: bool,
}

pub fn plan_document_write<'a, T>(
    document_id: String,
    items: Vec<&'a T>,
    existing: Option<Acl>,
    user_id: Option<&str>,
) -> DocumentWrite<'a, T> {
    let (acl, replaces_existing) = match existing {
        Some(stored) => (stored.merged_with_user(user_id), true),
        None => (Acl::for_user(user_id), false),
    };
    DocumentWrite {
        document_id,
        items,
        acl,
        replaces_existing,
    }
}

/// Documents seen minus documents replaced.
pub fn net_new_documents<T>(writes: &[DocumentWrite<'_, T>]) -> usize {
    writes.iter().filter(|w| !w.replaces_existing).count()
}

/// One ranked vector record: a parent chunk or one of its mini-chunks.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub parent_uuid: Uuid,
    /// Carries the cosine similarity in `score`.
    pub chunk: InferenceChunk,
}

/// Distinct parent chunks from `hits`, which must be ordered by descending
/// similarity. Stops at the first hit below `distance_cutoff`.
pub fn distinct_parents(
    hits: impl IntoIterator<Item = VectorHit>,
    num_to_retrieve: usize,
    distance_cutoff: f64,
) -> Vec<InferenceChunk> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut found = Vec::new();
    for hit in hits {
        if found.len() >= num_to_retrieve || hit.chunk.score.unwrap_or(0.0) < distance_cutoff {
            break;
        }
        if seen.insert(hit.parent_uuid) {
            found.push(hit.chunk);
        }
    }
    found
}

/// Dense-vector index with ACL payloads.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Write embedded chunks for `user_id` (`None` = public). Returns the
    /// net number of new documents.
    async fn index(&self, chunks: &[EmbeddedChunk], user_id: Option<&str>) -> Result<usize>;

    /// One page of records readable by `user_id`, ordered by descending
    /// cosine similarity. Mini-chunk records appear individually.
    async fn search_page(
        &self,
        query_vec: &[f32],
        user_id: Option<&str>,
        filters: &IndexFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<VectorHit>>;

    /// Up to `num_to_retrieve` distinct parent chunks with similarity at
    /// least `distance_cutoff`, paging through the index and collapsing
    /// mini-chunks onto their parent.
    async fn semantic_retrieval(
        &self,
        query_vec: &[f32],
        user_id: Option<&str>,
        filters: &IndexFilters,
        num_to_retrieve: usize,
        distance_cutoff: f64,
    ) -> Result<Vec<InferenceChunk>> {
        filters.validate()?;
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut found: Vec<InferenceChunk> = Vec::new();
        let mut offset = 0;
        let page_size = num_to_retrieve.max(1);

        'paging: while found.len() < num_to_retrieve {
            let page = self
                .search_page(query_vec, user_id, filters, page_size, offset)
                .await?;
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for hit in page {
                if hit.chunk.score.unwrap_or(0.0) < distance_cutoff {
                    break 'paging;
                }
                if seen.insert(hit.parent_uuid) {
                    found.push(hit.chunk);
                    if found.len() >= num_to_retrieve {
                        break 'paging;
                    }
                }
            }
        }

        Ok(found)
    }
}

/// Lexical index with ACL payloads.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Write chunks for `user_id` (`None` = public). Returns the net number
    /// of new documents.
    async fn index(&self, chunks: &[Chunk], user_id: Option<&str>) -> Result<usize>;

    /// Best `num_to_retrieve` chunks for a preprocessed query (see
    /// [`crate::keyword::preprocess_query`]), readable by `user_id`.
    async fn keyword_search(
        &self,
        query: &str,
        user_id: Option<&str>,
        filters: &IndexFilters,
        num_to_retrieve: usize,
    ) -> Result<Vec<InferenceChunk>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_uuid_stable_and_distinct() {
        assert_eq!(chunk_uuid("d1", 0, None), chunk_uuid("d1", 0, None));
        assert_ne!(chunk_uuid("d1", 0, None), chunk_uuid("d1", 1, None));
        assert_ne!(chunk_uuid("d1", 0, None), chunk_uuid("d1", 0, Some(1)));
        assert_eq!(embedding_uuid("d1", 3, 0), chunk_uuid("d1", 3, None));
    }

    #[test]
    fn test_group_by_document_keeps_order() {
        let items = vec![("b", 0), ("a", 0), ("b", 1), ("a", 1)];
        let groups = group_by_document(&items, |(doc, _)| doc);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b");
        assert_eq!(groups[0].1, vec![&("b", 0), &("b", 1)]);
        assert_eq!(groups[1].0, "a");
    }

    #[test]
    fn test_coherent_acl() {
        assert!(coherent_acl("d", vec![]).unwrap().is_none());
        let acl = Acl::for_user(Some("u1"));
        assert_eq!(
            coherent_acl("d", vec![acl.clone(), acl.clone()]).unwrap(),
            Some(acl.clone())
        );
        let err = coherent_acl("d", vec![acl, Acl::for_user(None)]).unwrap_err();
        assert!(matches!(err, CoreError::IndexCorruption { .. }));
    }

    #[test]
    fn test_plan_merges_existing_acl() {
        let items = vec![1, 2];
        let refs: Vec<&i32> = items.iter().collect();
        let write = plan_document_write(
            "d".to_string(),
            refs,
            Some(Acl::for_user(Some("u1"))),
            Some("u2"),
        );
        assert!(write.replaces_existing);
        assert!(write.acl.allowed_users.contains("u1"));
        assert!(write.acl.allowed_users.contains("u2"));

        let fresh = plan_document_write::<i32>("e".to_string(), vec![], None, None);
        assert!(!fresh.replaces_existing);
        assert_eq!(net_new_documents(&[write, fresh]), 1);
    }
}
