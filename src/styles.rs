//! Per-user style artefacts: the generated conversation style, the chat
//! pairs it was learned from, and a running plain-text transcript.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};

use mimic_core::style::ChatPair;

#[derive(Clone)]
pub struct StyleStore {
    pool: SqlitePool,
}

impl StyleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn conversation_style(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT conversation_style FROM user_styles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("conversation_style")))
    }

    pub async fn set_conversation_style(&self, user_id: &str, style: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_styles (user_id, conversation_style, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                conversation_style = excluded.conversation_style,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(style)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to store style for '{}'", user_id))?;
        Ok(())
    }

    /// Store a pair and append it to the user's transcript.
    pub async fn add_chat_pair(&self, user_id: &str, pair: &ChatPair) -> Result<()> {
        let now = Utc::now().timestamp();
        let entry = format!("Message: {}\nReply: {}\n", pair.message, pair.reply);

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO chat_pairs (user_id, message, reply, created_at) VALUES (?, ?, ?, ?)")
            .bind(user_id)
            .bind(&pair.message)
            .bind(&pair.reply)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO user_styles (user_id, chat_transcript, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                chat_transcript = COALESCE(user_styles.chat_transcript, '') || excluded.chat_transcript,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(&entry)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// The `limit` most recent pairs, oldest first.
    pub async fn recent_chat_pairs(&self, user_id: &str, limit: usize) -> Result<Vec<ChatPair>> {
        let rows = sqlx::query(
            "SELECT message, reply FROM chat_pairs WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut pairs: Vec<ChatPair> = rows
            .iter()
            .map(|r| ChatPair::new(r.get::<String, _>("message"), r.get::<String, _>("reply")))
            .collect();
        pairs.reverse();
        Ok(pairs)
    }

    pub async fn chat_pair_count(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_pairs WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn chat_transcript(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT chat_transcript FROM user_styles WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("chat_transcript")))
    }
}
