//! Idempotent schema creation.
//!
//! Timestamps are unix seconds. ACL columns hold JSON arrays of strings so
//! reads can filter with `json_each`. Keyword text is mirrored into the
//! `keyword_fts` FTS5 table (porter stemming); `keyword_fts_vocab` exposes
//! its term list for typo expansion.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS organizations (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        vector_collection TEXT NOT NULL,
        keyword_collection TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        display_name TEXT,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (org_id) REFERENCES organizations(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS connectors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL,
        source TEXT NOT NULL,
        input_type TEXT NOT NULL,
        config_json TEXT NOT NULL DEFAULT '{}',
        refresh_freq_secs INTEGER,
        disabled INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (org_id) REFERENCES organizations(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS credentials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT,
        public_doc INTEGER NOT NULL DEFAULT 0,
        credential_json TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS connector_credential_pairs (
        connector_id INTEGER NOT NULL,
        credential_id INTEGER NOT NULL,
        last_attempt_status TEXT,
        last_successful_index_time INTEGER,
        total_docs_indexed INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (connector_id, credential_id),
        FOREIGN KEY (connector_id) REFERENCES connectors(id),
        FOREIGN KEY (credential_id) REFERENCES credentials(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS index_attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        connector_id INTEGER NOT NULL,
        credential_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_msg TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (connector_id, credential_id)
            REFERENCES connector_credential_pairs(connector_id, credential_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_styles (
        user_id TEXT PRIMARY KEY,
        conversation_style TEXT,
        chat_transcript TEXT,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chat_pairs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        message TEXT NOT NULL,
        reply TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vector_chunks (
        collection TEXT NOT NULL,
        uuid TEXT NOT NULL,
        parent_uuid TEXT NOT NULL,
        document_id TEXT NOT NULL,
        chunk_id INTEGER NOT NULL,
        source_type TEXT NOT NULL,
        chunk_json TEXT NOT NULL,
        allowed_users TEXT NOT NULL,
        allowed_groups TEXT NOT NULL,
        embedding BLOB NOT NULL,
        PRIMARY KEY (collection, uuid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS keyword_chunks (
        collection TEXT NOT NULL,
        uuid TEXT NOT NULL,
        document_id TEXT NOT NULL,
        chunk_id INTEGER NOT NULL,
        source_type TEXT NOT NULL,
        chunk_json TEXT NOT NULL,
        allowed_users TEXT NOT NULL,
        allowed_groups TEXT NOT NULL,
        PRIMARY KEY (collection, uuid)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_attempts_status ON index_attempts(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_chat_pairs_user ON chat_pairs(user_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_vector_chunks_doc ON vector_chunks(collection, document_id)",
    "CREATE INDEX IF NOT EXISTS idx_keyword_chunks_doc ON keyword_chunks(collection, document_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }

    // Virtual tables are created only when missing.
    let fts_created = create_virtual_table(
        pool,
        "keyword_fts",
        r#"
        CREATE VIRTUAL TABLE keyword_fts USING fts5(
            collection UNINDEXED,
            uuid UNINDEXED,
            document_id UNINDEXED,
            semantic_identifier,
            content,
            tokenize = 'porter unicode61'
        )
        "#,
    )
    .await?;
    if fts_created {
        // Databases from before the text table existed.
        sqlx::query(
            r#"
            INSERT INTO keyword_fts (collection, uuid, document_id, semantic_identifier, content)
            SELECT collection, uuid, document_id,
                   json_extract(chunk_json, '$.semantic_identifier'),
                   json_extract(chunk_json, '$.content')
            FROM keyword_chunks
            "#,
        )
        .execute(pool)
        .await?;
    }
    create_virtual_table(
        pool,
        "keyword_fts_vocab",
        "CREATE VIRTUAL TABLE keyword_fts_vocab USING fts5vocab('keyword_fts', 'row')",
    )
    .await?;
    Ok(())
}

/// Returns whether the table was created.
async fn create_virtual_table(pool: &SqlitePool, name: &str, ddl: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
    )
    .bind(name)
    .fetch_one(pool)
    .await?;

    if !exists {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(!exists)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_reapplied_and_text_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_path(&dir.path().join("schema.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();

        sqlx::query(
            r#"
            INSERT INTO keyword_chunks (collection, uuid, document_id, chunk_id, source_type, chunk_json, allowed_users, allowed_groups)
            VALUES ('k', 'u-1', 'd1', 0, 'web', '{"semantic_identifier": "Guide", "content": "zebra crossing"}', '["PUBLIC"]', '[]')
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("DROP TABLE keyword_fts_vocab").execute(&pool).await.unwrap();
        sqlx::query("DROP TABLE keyword_fts").execute(&pool).await.unwrap();

        apply_schema(&pool).await.unwrap();
        apply_schema(&pool).await.unwrap();

        let hits: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM keyword_fts WHERE keyword_fts MATCH 'zebra'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(hits, 1);
    }
}
