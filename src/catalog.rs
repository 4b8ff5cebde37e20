//! Persistence collaborator for the runner and the assistant.
//!
//! [`Catalog`] covers organizations, users, connectors, credentials,
//! connector-credential pairs and index attempts. [`SqliteCatalog`] is the
//! only implementation; the trait exists so the runner and assistant take a
//! `&dyn Catalog` rather than a pool.
//!
//! Attempt status only moves forward:
//!
//! ```text
//! not_started → in_progress → success
//!                           ↘ failed
//! ```
//!
//! [`Catalog::transition_attempt`] rejects anything else, and
//! `total_docs_indexed` only ever grows.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::fmt;
use std::str::FromStr;

use mimic_core::connector::InputType;
use mimic_core::models::DocumentSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    NotStarted,
    InProgress,
    Success,
    Failed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::NotStarted => "not_started",
            AttemptStatus::InProgress => "in_progress",
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: AttemptStatus) -> bool {
        matches!(
            (self, next),
            (AttemptStatus::NotStarted, AttemptStatus::InProgress)
                | (AttemptStatus::InProgress, AttemptStatus::Success)
                | (AttemptStatus::InProgress, AttemptStatus::Failed)
        )
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(AttemptStatus::NotStarted),
            "in_progress" => Ok(AttemptStatus::InProgress),
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            other => bail!("Unknown attempt status: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub vector_collection: String,
    pub keyword_collection: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connector {
    pub id: i64,
    pub org_id: String,
    pub name: String,
    pub source: DocumentSource,
    pub input_type: InputType,
    /// Source-specific settings handed to the connector builder.
    pub config: Value,
    /// Seconds between scheduled runs; `None` means index once.
    pub refresh_freq_secs: Option<i64>,
    pub disabled: bool,
}

#[derive(Debug, Clone)]
pub struct NewConnector {
    pub org_id: String,
    pub name: String,
    pub source: DocumentSource,
    pub input_type: InputType,
    pub config: Value,
    pub refresh_freq_secs: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Credential {
    pub id: i64,
    pub user_id: Option<String>,
    /// Documents indexed with this credential are readable by anyone.
    pub public_doc: bool,
    pub credential_json: Value,
}

impl Credential {
    /// User the indexed documents are granted to; `None` means public.
    pub fn effective_user(&self) -> Option<&str> {
        if self.public_doc {
            None
        } else {
            self.user_id.as_deref()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorCredentialPair {
    pub connector_id: i64,
    pub credential_id: i64,
    pub last_attempt_status: Option<AttemptStatus>,
    pub last_successful_index_time: Option<DateTime<Utc>>,
    pub total_docs_indexed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexAttempt {
    pub id: i64,
    pub connector_id: i64,
    pub credential_id: i64,
    pub status: AttemptStatus,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    // Organizations and users
    async fn upsert_organization(&self, id: &str, name: &str) -> Result<Organization>;
    async fn get_organization(&self, id: &str) -> Result<Option<Organization>>;
    async fn add_user(&self, user_id: &str, org_id: &str, display_name: Option<&str>) -> Result<()>;
    async fn organization_for_user(&self, user_id: &str) -> Result<Option<Organization>>;

    // Connectors
    async fn create_connector(&self, new: NewConnector) -> Result<Connector>;
    async fn get_connector(&self, id: i64) -> Result<Option<Connector>>;
    async fn list_connectors(&self) -> Result<Vec<Connector>>;
    async fn list_enabled_connectors(&self) -> Result<Vec<Connector>>;
    async fn set_connector_input_type(&self, id: i64, input_type: InputType) -> Result<()>;
    async fn disable_connector(&self, id: i64) -> Result<()>;

    // Credentials
    async fn create_credential(
        &self,
        user_id: Option<&str>,
        public_doc: bool,
        credential_json: &Value,
    ) -> Result<Credential>;
    async fn get_credential(&self, id: i64) -> Result<Option<Credential>>;
    async fn update_credential_json(&self, id: i64, credential_json: &Value) -> Result<()>;

    // Connector-credential pairs
    async fn link_pair(&self, connector_id: i64, credential_id: i64) -> Result<ConnectorCredentialPair>;
    async fn get_pair(&self, connector_id: i64, credential_id: i64) -> Result<Option<ConnectorCredentialPair>>;
    async fn credentials_for_connector(&self, connector_id: i64) -> Result<Vec<Credential>>;
    async fn update_pair_status(&self, connector_id: i64, credential_id: i64, status: AttemptStatus) -> Result<()>;
    /// Mark the pair successful at `time` and add `net_new_docs` to its total.
    async fn record_pair_success(
        &self,
        connector_id: i64,
        credential_id: i64,
        time: DateTime<Utc>,
        net_new_docs: i64,
    ) -> Result<()>;

    // Index attempts
    async fn create_attempt(&self, connector_id: i64, credential_id: i64, now: DateTime<Utc>) -> Result<IndexAttempt>;
    async fn get_attempt(&self, id: i64) -> Result<Option<IndexAttempt>>;
    /// Attempts with `status`, oldest first.
    async fn list_attempts_by_status(&self, status: AttemptStatus) -> Result<Vec<IndexAttempt>>;
    async fn transition_attempt(
        &self,
        id: i64,
        status: AttemptStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;
    async fn last_successful_attempt(&self, connector_id: i64, credential_id: i64) -> Result<Option<IndexAttempt>>;
    async fn list_attempts_for_pair(&self, connector_id: i64, credential_id: i64) -> Result<Vec<IndexAttempt>>;
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn organization_from_row(row: &SqliteRow) -> Organization {
    Organization {
        id: row.get("id"),
        name: row.get("name"),
        vector_collection: row.get("vector_collection"),
        keyword_collection: row.get("keyword_collection"),
    }
}

fn connector_from_row(row: &SqliteRow) -> Result<Connector> {
    let source: String = row.get("source");
    let input_type: String = row.get("input_type");
    let config_json: String = row.get("config_json");
    let disabled: i64 = row.get("disabled");
    Ok(Connector {
        id: row.get("id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        source: source.parse()?,
        input_type: input_type.parse()?,
        config: serde_json::from_str(&config_json).context("connector config is not valid JSON")?,
        refresh_freq_secs: row.get("refresh_freq_secs"),
        disabled: disabled != 0,
    })
}

fn credential_from_row(row: &SqliteRow) -> Result<Credential> {
    let json: String = row.get("credential_json");
    let public_doc: i64 = row.get("public_doc");
    Ok(Credential {
        id: row.get("id"),
        user_id: row.get("user_id"),
        public_doc: public_doc != 0,
        credential_json: serde_json::from_str(&json).context("credential is not valid JSON")?,
    })
}

fn pair_from_row(row: &SqliteRow) -> Result<ConnectorCredentialPair> {
    let status: Option<String> = row.get("last_attempt_status");
    let last: Option<i64> = row.get("last_successful_index_time");
    Ok(ConnectorCredentialPair {
        connector_id: row.get("connector_id"),
        credential_id: row.get("credential_id"),
        last_attempt_status: status.map(|s| s.parse()).transpose()?,
        last_successful_index_time: last.map(from_ts),
        total_docs_indexed: row.get("total_docs_indexed"),
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<IndexAttempt> {
    let status: String = row.get("status");
    Ok(IndexAttempt {
        id: row.get("id"),
        connector_id: row.get("connector_id"),
        credential_id: row.get("credential_id"),
        status: status.parse()?,
        error_msg: row.get("error_msg"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    })
}

const ATTEMPT_COLUMNS: &str =
    "id, connector_id, credential_id, status, error_msg, created_at, updated_at";
const CONNECTOR_COLUMNS: &str =
    "id, org_id, name, source, input_type, config_json, refresh_freq_secs, disabled";

pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn upsert_organization(&self, id: &str, name: &str) -> Result<Organization> {
        sqlx::query(
            r#"
            INSERT INTO organizations (id, name, vector_collection, keyword_collection, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(format!("{}_vectors", id))
        .bind(format!("{}_keywords", id))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        self.get_organization(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("organization '{}' vanished after upsert", id))
    }

    async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            "SELECT id, name, vector_collection, keyword_collection FROM organizations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(organization_from_row))
    }

    async fn add_user(&self, user_id: &str, org_id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, org_id, display_name, created_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET org_id = excluded.org_id, display_name = excluded.display_name
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .bind(display_name)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to add user '{}' to organization '{}'", user_id, org_id))?;
        Ok(())
    }

    async fn organization_for_user(&self, user_id: &str) -> Result<Option<Organization>> {
        let row = sqlx::query(
            r#"
            SELECT o.id, o.name, o.vector_collection, o.keyword_collection
            FROM organizations o JOIN users u ON u.org_id = o.id
            WHERE u.id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(organization_from_row))
    }

    async fn create_connector(&self, new: NewConnector) -> Result<Connector> {
        let now = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO connectors (org_id, name, source, input_type, config_json, refresh_freq_secs, disabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&new.org_id)
        .bind(&new.name)
        .bind(new.source.as_str())
        .bind(new.input_type.as_str())
        .bind(serde_json::to_string(&new.config)?)
        .bind(new.refresh_freq_secs)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to create connector '{}'", new.name))?;
        self.get_connector(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("connector {} vanished after insert", id))
    }

    async fn get_connector(&self, id: i64) -> Result<Option<Connector>> {
        let sql = format!("SELECT {} FROM connectors WHERE id = ?", CONNECTOR_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(connector_from_row).transpose()
    }

    async fn list_connectors(&self) -> Result<Vec<Connector>> {
        let sql = format!("SELECT {} FROM connectors ORDER BY id", CONNECTOR_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(connector_from_row).collect()
    }

    async fn list_enabled_connectors(&self) -> Result<Vec<Connector>> {
        let sql = format!(
            "SELECT {} FROM connectors WHERE disabled = 0 ORDER BY id",
            CONNECTOR_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(connector_from_row).collect()
    }

    async fn set_connector_input_type(&self, id: i64, input_type: InputType) -> Result<()> {
        let result = sqlx::query("UPDATE connectors SET input_type = ?, updated_at = ? WHERE id = ?")
            .bind(input_type.as_str())
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("connector {} not found", id);
        }
        Ok(())
    }

    async fn disable_connector(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE connectors SET disabled = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_credential(
        &self,
        user_id: Option<&str>,
        public_doc: bool,
        credential_json: &Value,
    ) -> Result<Credential> {
        let now = Utc::now().timestamp();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO credentials (user_id, public_doc, credential_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(public_doc as i64)
        .bind(serde_json::to_string(credential_json)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        self.get_credential(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("credential {} vanished after insert", id))
    }

    async fn get_credential(&self, id: i64) -> Result<Option<Credential>> {
        let row = sqlx::query(
            "SELECT id, user_id, public_doc, credential_json FROM credentials WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(credential_from_row).transpose()
    }

    async fn update_credential_json(&self, id: i64, credential_json: &Value) -> Result<()> {
        sqlx::query("UPDATE credentials SET credential_json = ?, updated_at = ? WHERE id = ?")
            .bind(serde_json::to_string(credential_json)?)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn link_pair(&self, connector_id: i64, credential_id: i64) -> Result<ConnectorCredentialPair> {
        sqlx::query(
            r#"
            INSERT INTO connector_credential_pairs (connector_id, credential_id, total_docs_indexed)
            VALUES (?, ?, 0)
            ON CONFLICT(connector_id, credential_id) DO NOTHING
            "#,
        )
        .bind(connector_id)
        .bind(credential_id)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to link connector {} with credential {}",
                connector_id, credential_id
            )
        })?;
        self.get_pair(connector_id, credential_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("pair vanished after insert"))
    }

    async fn get_pair(&self, connector_id: i64, credential_id: i64) -> Result<Option<ConnectorCredentialPair>> {
        let row = sqlx::query(
            r#"
            SELECT connector_id, credential_id, last_attempt_status, last_successful_index_time, total_docs_indexed
            FROM connector_credential_pairs WHERE connector_id = ? AND credential_id = ?
            "#,
        )
        .bind(connector_id)
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(pair_from_row).transpose()
    }

    async fn credentials_for_connector(&self, connector_id: i64) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.user_id, c.public_doc, c.credential_json
            FROM credentials c JOIN connector_credential_pairs p ON p.credential_id = c.id
            WHERE p.connector_id = ?
            ORDER BY c.id
            "#,
        )
        .bind(connector_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(credential_from_row).collect()
    }

    async fn update_pair_status(&self, connector_id: i64, credential_id: i64, status: AttemptStatus) -> Result<()> {
        sqlx::query(
            "UPDATE connector_credential_pairs SET last_attempt_status = ? WHERE connector_id = ? AND credential_id = ?",
        )
        .bind(status.as_str())
        .bind(connector_id)
        .bind(credential_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_pair_success(
        &self,
        connector_id: i64,
        credential_id: i64,
        time: DateTime<Utc>,
        net_new_docs: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connector_credential_pairs
            SET last_attempt_status = ?, last_successful_index_time = ?, total_docs_indexed = total_docs_indexed + ?
            WHERE connector_id = ? AND credential_id = ?
            "#,
        )
        .bind(AttemptStatus::Success.as_str())
        .bind(time.timestamp())
        .bind(net_new_docs.max(0))
        .bind(connector_id)
        .bind(credential_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_attempt(&self, connector_id: i64, credential_id: i64, now: DateTime<Utc>) -> Result<IndexAttempt> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO index_attempts (connector_id, credential_id, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(connector_id)
        .bind(credential_id)
        .bind(AttemptStatus::NotStarted.as_str())
        .bind(now.timestamp())
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?;
        self.get_attempt(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("attempt {} vanished after insert", id))
    }

    async fn get_attempt(&self, id: i64) -> Result<Option<IndexAttempt>> {
        let sql = format!("SELECT {} FROM index_attempts WHERE id = ?", ATTEMPT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn list_attempts_by_status(&self, status: AttemptStatus) -> Result<Vec<IndexAttempt>> {
        let sql = format!(
            "SELECT {} FROM index_attempts WHERE status = ? ORDER BY created_at, id",
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn transition_attempt(
        &self,
        id: i64,
        status: AttemptStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let current = self
            .get_attempt(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("index attempt {} not found", id))?;
        if !current.status.can_transition_to(status) {
            bail!(
                "invalid attempt transition {} → {} for attempt {}",
                current.status,
                status,
                id
            );
        }
        // Guard on the old status so a concurrent writer cannot skip a state.
        let result = sqlx::query(
            "UPDATE index_attempts SET status = ?, error_msg = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(error_msg)
        .bind(now.timestamp())
        .bind(id)
        .bind(current.status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("index attempt {} changed status concurrently", id);
        }
        Ok(())
    }

    async fn last_successful_attempt(&self, connector_id: i64, credential_id: i64) -> Result<Option<IndexAttempt>> {
        let sql = format!(
            r#"
            SELECT {} FROM index_attempts
            WHERE connector_id = ? AND credential_id = ? AND status = ?
            ORDER BY updated_at DESC, id DESC LIMIT 1
            "#,
            ATTEMPT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(connector_id)
            .bind(credential_id)
            .bind(AttemptStatus::Success.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn list_attempts_for_pair(&self, connector_id: i64, credential_id: i64) -> Result<Vec<IndexAttempt>> {
        let sql = format!(
            "SELECT {} FROM index_attempts WHERE connector_id = ? AND credential_id = ? ORDER BY created_at, id",
            ATTEMPT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(connector_id)
            .bind(credential_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(attempt_from_row).collect()
    }
}
