//! SQLite-backed vector and keyword indexes.
//!
//! Both live in shared tables partitioned by a `collection` column, one
//! pair of collections per organization. The ACL read filter runs in SQL
//! over the JSON `allowed_users` column:
//!
//! ```sql
//! EXISTS (SELECT 1 FROM json_each(allowed_users) WHERE value IN (?, 'PUBLIC'))
//! ```
//!
//! Binding `NULL` as the user leaves only public rows. Source-type and
//! document-id filters are SQL predicates as well.
//!
//! Keyword text is mirrored into the `keyword_fts` FTS5 table (porter
//! stemming, unicode61 tokens) and ranked with `bm25`, weighting the
//! semantic identifier [`keyword::IDENTIFIER_WEIGHT`] times the content.
//! Query terms are OR-ed so partial matches still rank; terms of four or
//! more characters are widened with close spellings from the
//! `keyword_fts_vocab` term list.
//!
//! Writes follow the shared discipline in [`mimic_core::index`]: look up the
//! stored ACL, merge, delete the document's rows, insert. A document is
//! never split across transactions; small documents are grouped until a
//! transaction holds `write_batch_size` records.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use mimic_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use mimic_core::error::CoreError;
use mimic_core::index::{
    chunk_uuid, coherent_acl, distinct_parents, embedding_uuid, group_by_document,
    net_new_documents, plan_document_write, DocumentWrite, KeywordIndex, VectorHit, VectorIndex,
};
use mimic_core::keyword;
use mimic_core::models::{
    Acl, Chunk, EmbeddedChunk, IndexFilters, InferenceChunk, SearchType, PUBLIC_ACL,
};

const ACL_FILTER: &str =
    "EXISTS (SELECT 1 FROM json_each(allowed_users) WHERE json_each.value IN (?, ?))";

#[derive(Clone, Copy)]
enum Table {
    Vector,
    Keyword,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Vector => "vector_chunks",
            Table::Keyword => "keyword_chunks",
        }
    }
}

/// Filter predicates over the chunk table aliased `k`, with their bind
/// values in order.
fn filter_clause(filters: &IndexFilters) -> (String, Vec<String>) {
    let mut sql = String::new();
    let mut binds = Vec::new();
    if let Some(sources) = &filters.source_types {
        sql.push_str(&format!(" AND k.source_type IN ({})", placeholders(sources.len())));
        binds.extend(sources.iter().map(|s| s.as_str().to_string()));
    }
    if let Some(ids) = &filters.document_ids {
        sql.push_str(&format!(" AND k.document_id IN ({})", placeholders(ids.len())));
        binds.extend(ids.iter().cloned());
    }
    (sql, binds)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn acl_to_json(set: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(set)?)
}

fn acl_from_row(document_id: &str, users: &str, groups: &str) -> Result<Acl, CoreError> {
    let parse = |raw: &str| -> Result<BTreeSet<String>, CoreError> {
        serde_json::from_str(raw)
            .map_err(|e| CoreError::corruption(document_id, format!("unreadable ACL: {}", e)))
    };
    Ok(Acl {
        allowed_users: parse(users)?,
        allowed_groups: parse(groups)?,
    })
}

/// Distinct ACLs stored for one document.
async fn stored_acl(
    pool: &SqlitePool,
    table: Table,
    collection: &str,
    document_id: &str,
) -> Result<Option<Acl>> {
    let sql = format!(
        "SELECT DISTINCT allowed_users, allowed_groups FROM {} WHERE collection = ? AND document_id = ?",
        table.name()
    );
    let rows = sqlx::query(&sql)
        .bind(collection)
        .bind(document_id)
        .fetch_all(pool)
        .await
        .map_err(|e| CoreError::corruption(document_id, format!("ACL lookup failed: {}", e)))?;

    let mut acls = Vec::with_capacity(rows.len());
    for row in rows {
        let users: String = row.get("allowed_users");
        let groups: String = row.get("allowed_groups");
        acls.push(acl_from_row(document_id, &users, &groups)?);
    }
    Ok(coherent_acl(document_id, acls)?)
}

async fn plan_writes<'a, T>(
    pool: &SqlitePool,
    table: Table,
    collection: &str,
    groups: Vec<(String, Vec<&'a T>)>,
    user_id: Option<&str>,
) -> Result<Vec<DocumentWrite<'a, T>>> {
    let mut writes = Vec::with_capacity(groups.len());
    for (document_id, items) in groups {
        let existing = stored_acl(pool, table, collection, &document_id).await?;
        writes.push(plan_document_write(document_id, items, existing, user_id));
    }
    Ok(writes)
}

async fn delete_document(
    tx: &mut Transaction<'_, Sqlite>,
    table: Table,
    collection: &str,
    document_id: &str,
) -> Result<()> {
    let sql = format!(
        "DELETE FROM {} WHERE collection = ? AND document_id = ?",
        table.name()
    );
    sqlx::query(&sql)
        .bind(collection)
        .bind(document_id)
        .execute(&mut **tx)
        .await?;

    if matches!(table, Table::Keyword) {
        sqlx::query("DELETE FROM keyword_fts WHERE collection = ? AND document_id = ?")
            .bind(collection)
            .bind(document_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn parse_chunk(raw: &str) -> Result<Chunk> {
    serde_json::from_str(raw).context("stored chunk is not valid JSON")
}

// ============ Vector Index ============

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    collection: String,
    write_batch_size: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, collection: impl Into<String>, write_batch_size: usize) -> Self {
        Self {
            pool,
            collection: collection.into(),
            write_batch_size: write_batch_size.max(1),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Stored vector rows, mini-chunks included.
    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_chunks WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// ACL of every stored row of `document_id`.
    pub async fn acls_for_document(&self, document_id: &str) -> Result<Vec<Acl>> {
        let rows = sqlx::query(
            "SELECT allowed_users, allowed_groups FROM vector_chunks WHERE collection = ? AND document_id = ?",
        )
        .bind(&self.collection)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let users: String = row.get("allowed_users");
                let groups: String = row.get("allowed_groups");
                Ok(acl_from_row(document_id, &users, &groups)?)
            })
            .collect()
    }

    /// Every readable record matching `filters`, by descending cosine
    /// similarity.
    async fn ranked(
        &self,
        query_vec: &[f32],
        user_id: Option<&str>,
        filters: &IndexFilters,
    ) -> Result<Vec<VectorHit>> {
        let (filter_sql, filter_binds) = filter_clause(filters);
        let sql = format!(
            "SELECT k.parent_uuid, k.chunk_json, k.embedding FROM vector_chunks k WHERE k.collection = ? AND {}{}",
            ACL_FILTER, filter_sql
        );
        let mut query = sqlx::query(&sql)
            .bind(&self.collection)
            .bind(user_id)
            .bind(PUBLIC_ACL);
        for value in &filter_binds {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut scored: Vec<(f64, Uuid, Chunk)> = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk = parse_chunk(&row.get::<String, _>("chunk_json"))?;
            let parent: String = row.get("parent_uuid");
            let parent_uuid = Uuid::parse_str(&parent)
                .map_err(|e| CoreError::corruption(&chunk.document_id, e.to_string()))?;
            let embedding = blob_to_vec(&row.get::<Vec<u8>, _>("embedding"));
            let score = cosine_similarity(query_vec, &embedding) as f64;
            scored.push((score, parent_uuid, chunk));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .map(|(score, parent_uuid, chunk)| VectorHit {
                parent_uuid,
                chunk: InferenceChunk::from_chunk(&chunk, SearchType::Semantic, Some(score)),
            })
            .collect())
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        embedded: &EmbeddedChunk,
        acl: &Acl,
    ) -> Result<usize> {
        let chunk = &embedded.chunk;
        let chunk_json = serde_json::to_string(chunk)?;
        let users = acl_to_json(&acl.allowed_users)?;
        let groups = acl_to_json(&acl.allowed_groups)?;
        let parent_uuid = chunk_uuid(&chunk.document_id, chunk.chunk_id, None).to_string();

        for (i, vector) in embedded.embeddings.iter().enumerate() {
            let uuid = embedding_uuid(&chunk.document_id, chunk.chunk_id, i).to_string();
            sqlx::query(
                r#"
                INSERT INTO vector_chunks (collection, uuid, parent_uuid, document_id, chunk_id, source_type, chunk_json, allowed_users, allowed_groups, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, uuid) DO UPDATE SET
                    parent_uuid = excluded.parent_uuid,
                    document_id = excluded.document_id,
                    chunk_id = excluded.chunk_id,
                    source_type = excluded.source_type,
                    chunk_json = excluded.chunk_json,
                    allowed_users = excluded.allowed_users,
                    allowed_groups = excluded.allowed_groups,
                    embedding = excluded.embedding
                "#,
            )
            .bind(&self.collection)
            .bind(&uuid)
            .bind(&parent_uuid)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_id as i64)
            .bind(chunk.source_type.as_str())
            .bind(&chunk_json)
            .bind(&users)
            .bind(&groups)
            .bind(vec_to_blob(vector))
            .execute(&mut **tx)
            .await?;
        }
        Ok(embedded.embeddings.len())
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn index(&self, chunks: &[EmbeddedChunk], user_id: Option<&str>) -> Result<usize> {
        let groups = group_by_document(chunks, |c| c.chunk.document_id.as_str());
        let writes = plan_writes(&self.pool, Table::Vector, &self.collection, groups, user_id).await?;

        let mut tx = self.pool.begin().await?;
        let mut in_tx = 0;
        for write in &writes {
            if write.replaces_existing {
                delete_document(&mut tx, Table::Vector, &self.collection, &write.document_id).await?;
            }
            for embedded in &write.items {
                in_tx += self.insert(&mut tx, embedded, &write.acl).await?;
            }
            if in_tx >= self.write_batch_size {
                tx.commit().await?;
                tx = self.pool.begin().await?;
                in_tx = 0;
            }
        }
        tx.commit().await?;

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
        let hits = self.ranked(query_vec, user_id, filters).await?;
        Ok(hits.into_iter().skip(offset).take(limit).collect())
    }

    /// Scores the collection once and collapses mini-chunks in memory.
    async fn semantic_retrieval(
        &self,
        query_vec: &[f32],
        user_id: Option<&str>,
        filters: &IndexFilters,
        num_to_retrieve: usize,
        distance_cutoff: f64,
    ) -> Result<Vec<InferenceChunk>> {
        filters.validate()?;
        let hits = self.ranked(query_vec, user_id, filters).await?;
        Ok(distinct_parents(hits, num_to_retrieve, distance_cutoff))
    }
}

// ============ Keyword Index ============

pub struct SqliteKeywordIndex {
    pool: SqlitePool,
    collection: String,
    write_batch_size: usize,
}

impl SqliteKeywordIndex {
    pub fn new(pool: SqlitePool, collection: impl Into<String>, write_batch_size: usize) -> Self {
        Self {
            pool,
            collection: collection.into(),
            write_batch_size: write_batch_size.max(1),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keyword_chunks WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Blurbs of the stored chunks of `document_id`, in chunk order.
    pub async fn blurbs_for_document(&self, document_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT chunk_json FROM keyword_chunks WHERE collection = ? AND document_id = ? ORDER BY chunk_id",
        )
        .bind(&self.collection)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| Ok(parse_chunk(&row.get::<String, _>("chunk_json"))?.blurb))
            .collect()
    }
}

#[async_trait]
impl KeywordIndex for SqliteKeywordIndex {
    async fn index(&self, chunks: &[Chunk], user_id: Option<&str>) -> Result<usize> {
        let groups = group_by_document(chunks, |c| c.document_id.as_str());
        let writes = plan_writes(&self.pool, Table::Keyword, &self.collection, groups, user_id).await?;

        let mut tx = self.pool.begin().await?;
        let mut in_tx = 0;
        for write in &writes {
            if write.replaces_existing {
                delete_document(&mut tx, Table::Keyword, &self.collection, &write.document_id).await?;
            }
            let users = acl_to_json(&write.acl.allowed_users)?;
            let groups = acl_to_json(&write.acl.allowed_groups)?;
            // A chunk listed twice in one write gets one text row.
            let mut fts_written = HashSet::new();
            for chunk in &write.items {
                let uuid = chunk_uuid(&chunk.document_id, chunk.chunk_id, None).to_string();
                sqlx::query(
                    r#"
                    INSERT INTO keyword_chunks (collection, uuid, document_id, chunk_id, source_type, chunk_json, allowed_users, allowed_groups)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(collection, uuid) DO UPDATE SET
                        document_id = excluded.document_id,
                        chunk_id = excluded.chunk_id,
                        source_type = excluded.source_type,
                        chunk_json = excluded.chunk_json,
                        allowed_users = excluded.allowed_users,
                        allowed_groups = excluded.allowed_groups
                    "#,
                )
                .bind(&self.collection)
                .bind(&uuid)
                .bind(&chunk.document_id)
                .bind(chunk.chunk_id as i64)
                .bind(chunk.source_type.as_str())
                .bind(serde_json::to_string(*chunk)?)
                .bind(&users)
                .bind(&groups)
                .execute(&mut *tx)
                .await?;

                if fts_written.insert(uuid.clone()) {
                    sqlx::query(
                        "INSERT INTO keyword_fts (collection, uuid, document_id, semantic_identifier, content) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(&self.collection)
                    .bind(&uuid)
                    .bind(&chunk.document_id)
                    .bind(&chunk.semantic_identifier)
                    .bind(&chunk.content)
                    .execute(&mut *tx)
                    .await?;
                }
                in_tx += 1;
            }
            if in_tx >= self.write_batch_size {
                tx.commit().await?;
                tx = self.pool.begin().await?;
                in_tx = 0;
            }
        }
        tx.commit().await?;

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
        let mut terms: Vec<&str> = Vec::new();
        for term in query.split_whitespace() {
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        if terms.is_empty() || num_to_retrieve == 0 {
            return Ok(Vec::new());
        }

        let expanded = self.expand_typos(&terms).await?;
        let match_expr = match_expression(&expanded);

        let (filter_sql, filter_binds) = filter_clause(filters);
        let sql = format!(
            r#"
            SELECT k.chunk_json, bm25(keyword_fts, 0.0, 0.0, 0.0, {weight:.1}, 1.0) AS score
            FROM keyword_fts
            JOIN keyword_chunks k
              ON k.collection = keyword_fts.collection AND k.uuid = keyword_fts.uuid
            WHERE keyword_fts MATCH ?
              AND keyword_fts.collection = ?
              AND {acl}{filters}
            ORDER BY score, k.document_id, k.chunk_id
            LIMIT ?
            "#,
            weight = keyword::IDENTIFIER_WEIGHT,
            acl = ACL_FILTER,
            filters = filter_sql,
        );
        let mut q = sqlx::query(&sql)
            .bind(&match_expr)
            .bind(&self.collection)
            .bind(user_id)
            .bind(PUBLIC_ACL);
        for value in &filter_binds {
            q = q.bind(value);
        }
        let rows = q.bind(num_to_retrieve as i64).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let chunk = parse_chunk(&row.get::<String, _>("chunk_json"))?;
                // bm25 is lower-is-better.
                let score: f64 = -row.get::<f64, _>("score");
                Ok(InferenceChunk::from_chunk(&chunk, SearchType::Keyword, Some(score)))
            })
            .collect()
    }
}

impl SqliteKeywordIndex {
    /// Each query term plus the indexed terms within its typo budget.
    ///
    /// Candidates share the term's first character; the edit distance is
    /// checked against the vocabulary's stemmed forms.
    async fn expand_typos(&self, terms: &[&str]) -> Result<Vec<String>> {
        let mut expanded: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
        for term in terms {
            let budget = keyword::typo_budget(term);
            let Some(first) = term.chars().next() else {
                continue;
            };
            if budget == 0 {
                continue;
            }
            let len = term.chars().count() as i64;
            let candidates: Vec<String> = sqlx::query_scalar(
                "SELECT term FROM keyword_fts_vocab WHERE substr(term, 1, 1) = ? AND length(term) BETWEEN ? AND ?",
            )
            .bind(first.to_string())
            .bind(len - budget as i64)
            .bind(len + budget as i64)
            .fetch_all(&self.pool)
            .await?;

            for candidate in candidates {
                if keyword::is_typo_of(term, &candidate) && !expanded.contains(&candidate) {
                    expanded.push(candidate);
                }
            }
        }
        Ok(expanded)
    }
}

/// FTS5 query matching any of `terms`. Each term is a quoted string so
/// operator words like `OR` and `NOT` stay literal.
fn match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Resolves an organization's collection names to index handles.
///
/// The runner and the assistant go through this so tests can substitute
/// in-memory indexes.
pub trait IndexFactory: Send + Sync {
    fn vector(&self, collection: &str) -> Arc<dyn VectorIndex>;
    fn keyword(&self, collection: &str) -> Arc<dyn KeywordIndex>;
}

pub struct SqliteIndexFactory {
    pool: SqlitePool,
    write_batch_size: usize,
}

impl SqliteIndexFactory {
    pub fn new(pool: SqlitePool, write_batch_size: usize) -> Self {
        Self {
            pool,
            write_batch_size,
        }
    }
}

impl IndexFactory for SqliteIndexFactory {
    fn vector(&self, collection: &str) -> Arc<dyn VectorIndex> {
        Arc::new(SqliteVectorIndex::new(
            self.pool.clone(),
            collection,
            self.write_batch_size,
        ))
    }

    fn keyword(&self, collection: &str) -> Arc<dyn KeywordIndex> {
        Arc::new(SqliteKeywordIndex::new(
            self.pool.clone(),
            collection,
            self.write_batch_size,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::apply_schema;
    use mimic_core::models::DocumentSource;
    use std::collections::BTreeMap;

    async fn pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect_path(&dir.path().join("test.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        (dir, pool)
    }

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

    fn embedded(doc: &str, id: usize, vectors: Vec<Vec<f32>>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: chunk(doc, id, "text"),
            embeddings: vectors,
        }
    }

    #[tokio::test]
    async fn test_vector_acl_merge_and_filter() {
        let (_dir, pool) = pool().await;
        let index = SqliteVectorIndex::new(pool, "org1_vectors", 2);
        let chunks = vec![
            embedded("d1", 0, vec![vec![1.0, 0.0]]),
            embedded("d1", 1, vec![vec![0.9, 0.1]]),
        ];
        assert_eq!(index.index(&chunks, Some("u2")).await.unwrap(), 1);
        assert_eq!(index.index(&chunks, Some("u3")).await.unwrap(), 0);

        let acls = index.acls_for_document("d1").await.unwrap();
        assert_eq!(acls.len(), 2);
        assert!(acls.iter().all(|a| a == &acls[0]));
        assert!(acls[0].allowed_users.contains("u2") && acls[0].allowed_users.contains("u3"));

        let filters = IndexFilters::default();
        let none = index.search_page(&[1.0, 0.0], Some("u1"), &filters, 10, 0).await.unwrap();
        assert!(none.is_empty());
        let public = index.search_page(&[1.0, 0.0], None, &filters, 10, 0).await.unwrap();
        assert!(public.is_empty());
        let hits = index.search_page(&[1.0, 0.0], Some("u3"), &filters, 10, 0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.chunk_id, 0);
    }

    #[tokio::test]
    async fn test_vector_reingest_is_idempotent_and_collapses_minis() {
        let (_dir, pool) = pool().await;
        let index = SqliteVectorIndex::new(pool, "c", 64);
        let chunks = vec![embedded("d1", 0, vec![vec![1.0, 0.0], vec![0.99, 0.01], vec![0.98, 0.02]])];
        index.index(&chunks, None).await.unwrap();
        let first = index.count().await.unwrap();
        index.index(&chunks, None).await.unwrap();
        assert_eq!(index.count().await.unwrap(), first);
        assert_eq!(first, 3);

        let found = index
            .semantic_retrieval(&[1.0, 0.0], Some("anyone"), &IndexFilters::default(), 10, 0.1)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let (_dir, pool) = pool().await;
        let a = SqliteKeywordIndex::new(pool.clone(), "a", 64);
        let b = SqliteKeywordIndex::new(pool, "b", 64);
        a.index(&[chunk("d1", 0, "eiffel tower paris")], None).await.unwrap();
        let hits = b
            .keyword_search("eiffel", None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
        assert_eq!(a.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_ranks_and_filters() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool, "k", 1);
        let chunks = vec![
            chunk("tower", 0, "the eiffel tower stands in paris"),
            chunk("bridge", 0, "golden gate bridge in san francisco"),
        ];
        assert_eq!(index.index(&chunks, None).await.unwrap(), 2);

        let hits = index
            .keyword_search("eiffel tower", Some("u1"), &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "tower");
        assert_eq!(hits[0].search_type, SearchType::Keyword);

        let filters = IndexFilters {
            document_ids: Some(vec!["bridge".to_string()]),
            ..IndexFilters::default()
        };
        let hits = index.keyword_search("eiffel", None, &filters, 10).await.unwrap();
        assert!(hits.is_empty());

        let bad = IndexFilters {
            source_types: Some(vec![]),
            ..IndexFilters::default()
        };
        assert!(index.keyword_search("eiffel", None, &bad, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_chunks_removed_on_reingest() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool, "k", 64);
        index
            .index(&[chunk("d1", 0, "one"), chunk("d1", 1, "two")], None)
            .await
            .unwrap();
        index.index(&[chunk("d1", 0, "one")], None).await.unwrap();
        assert_eq!(index.count().await.unwrap(), 1);
        assert_eq!(index.blurbs_for_document("d1").await.unwrap(), vec!["one".to_string()]);
    }

    #[tokio::test]
    async fn test_stopword_only_query_finds_chunk() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool, "k", 64);
        index
            .index(&[chunk("d1", 0, "what is it"), chunk("d2", 0, "tower")], None)
            .await
            .unwrap();
        let query = keyword::preprocess_query("what is it");
        let hits = index
            .keyword_search(&query, None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
    }

    #[tokio::test]
    async fn test_keyword_typos_stems_and_title_weight() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool, "k", 64);
        let mut titled = chunk("guide", 0, "walking routes around the river");
        titled.semantic_identifier = "Eiffel".to_string();
        index
            .index(
                &[
                    chunk("body", 0, "the eiffel tower has three levels"),
                    titled,
                    chunk("other", 0, "golden gate bridge"),
                    chunk("harbor", 0, "sunset over the harbor"),
                    chunk("market", 0, "saturday flower market"),
                ],
                None,
            )
            .await
            .unwrap();

        let hits = index
            .keyword_search("eifel", None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["guide", "body"]);
        assert!(hits.iter().all(|h| h.score.unwrap() > 0.0));

        // Porter stemming on both sides.
        let hits = index
            .keyword_search("level", None, &IndexFilters::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "body");
    }

    #[tokio::test]
    async fn test_partial_match_ranks_below_full_match() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool, "k", 64);
        index
            .index(
                &[
                    chunk("partial", 0, "eiffel bridge"),
                    chunk("full", 0, "eiffel tower"),
                    chunk("harbor", 0, "sunset over the harbor"),
                    chunk("market", 0, "saturday flower market"),
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
        assert_eq!(hits[0].document_id, "full");
    }

    #[tokio::test]
    async fn test_reingest_drops_stale_text() {
        let (_dir, pool) = pool().await;
        let index = SqliteKeywordIndex::new(pool.clone(), "k", 64);
        index.index(&[chunk("d1", 0, "old zebra notes")], None).await.unwrap();
        index.index(&[chunk("d1", 0, "new giraffe notes")], None).await.unwrap();

        let filters = IndexFilters::default();
        assert!(index.keyword_search("zebra", None, &filters, 10).await.unwrap().is_empty());
        assert_eq!(index.keyword_search("giraffe", None, &filters, 10).await.unwrap().len(), 1);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keyword_fts WHERE collection = 'k'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_semantic_retrieval_collapses_and_cuts_off() {
        let (_dir, pool) = pool().await;
        let index = SqliteVectorIndex::new(pool, "v", 64);
        let chunks = vec![
            embedded("d1", 0, vec![vec![1.0, 0.0], vec![0.99, 0.05], vec![0.98, 0.1]]),
            embedded("d2", 0, vec![vec![0.9, 0.3]]),
            embedded("d3", 0, vec![vec![0.0, 1.0]]),
        ];
        index.index(&chunks, None).await.unwrap();

        let filters = IndexFilters::default();
        let found = index
            .semantic_retrieval(&[1.0, 0.0], None, &filters, 10, 0.5)
            .await
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d2"]);

        let one = index
            .semantic_retrieval(&[1.0, 0.0], None, &filters, 1, 0.5)
            .await
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].document_id, "d1");

        let only_d3 = IndexFilters {
            document_ids: Some(vec!["d3".to_string()]),
            ..IndexFilters::default()
        };
        let page = index
            .search_page(&[1.0, 0.0], None, &only_d3, 10, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].chunk.document_id, "d3");
    }
}
