//! Connector runner.
//!
//! A single-threaded periodic coordinator over connector-credential pairs.
//! Each pass runs three phases in order:
//!
//! 1. **Recovery** (once per process): every `in_progress` attempt was
//!    orphaned by a previous process and becomes `failed`, as does its pair.
//! 2. **Creation**: for each enabled connector and linked credential, a
//!    `not_started` attempt is created when the pair never succeeded, or
//!    when `refresh_freq_secs` has elapsed since its last success.
//!    Connectors stored as `load_state` whose source can be polled are
//!    rewritten to `poll` first.
//! 3. **Execution**: `not_started` attempts run one at a time, oldest
//!    first. Event connectors are left untouched.
//!
//! Attempt failures are recorded on the attempt and the pair; they never
//! stop the pass.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use mimic_core::chunk::ChunkingParams;
use mimic_core::connector::{ConnectorHandle, InputType};
use mimic_core::embedding::EmbeddingProvider;
use mimic_core::pipeline::IndexingPipeline;

use crate::catalog::{AttemptStatus, Catalog, Connector, Credential, IndexAttempt};
use crate::connectors::ConnectorFactory;
use crate::sqlite_index::IndexFactory;

const RECOVERY_NOTE: &str = "Stopped mid run, likely due to the background process being killed";

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub recovered: usize,
    pub created: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

enum AttemptOutcome {
    Succeeded,
    Failed,
    Skipped,
}

pub struct Runner {
    catalog: Arc<dyn Catalog>,
    connectors: Arc<ConnectorFactory>,
    indexes: Arc<dyn IndexFactory>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunking: ChunkingParams,
    embed_batch_size: usize,
}

impl Runner {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        connectors: Arc<ConnectorFactory>,
        indexes: Arc<dyn IndexFactory>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunking: ChunkingParams,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            catalog,
            connectors,
            indexes,
            embedder,
            chunking,
            embed_batch_size,
        }
    }

    /// Fail every attempt left `in_progress` by a previous process.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self
            .catalog
            .list_attempts_by_status(AttemptStatus::InProgress)
            .await?;
        for attempt in &stale {
            warn!(
                attempt_id = attempt.id,
                connector_id = attempt.connector_id,
                credential_id = attempt.credential_id,
                "marking orphaned attempt as failed"
            );
            self.catalog
                .transition_attempt(attempt.id, AttemptStatus::Failed, Some(RECOVERY_NOTE), now)
                .await?;
            self.catalog
                .update_pair_status(attempt.connector_id, attempt.credential_id, AttemptStatus::Failed)
                .await?;
        }
        Ok(stale.len())
    }

    /// Create the attempts due at `now`.
    pub async fn create_attempts(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;
        for mut connector in self.catalog.list_enabled_connectors().await? {
            if connector.input_type == InputType::LoadState
                && self.connectors.supports(connector.source, InputType::Poll)
            {
                if let Err(e) = self
                    .catalog
                    .set_connector_input_type(connector.id, InputType::Poll)
                    .await
                {
                    error!(
                        connector_id = connector.id,
                        error = %format!("{:#}", e),
                        "failed to switch connector to poll, skipping"
                    );
                    continue;
                }
                info!(connector_id = connector.id, "connector switched from load_state to poll");
                connector.input_type = InputType::Poll;
            }

            for credential in self.catalog.credentials_for_connector(connector.id).await? {
                if self.attempt_due(&connector, &credential, now).await? {
                    let attempt = self
                        .catalog
                        .create_attempt(connector.id, credential.id, now)
                        .await?;
                    debug!(
                        attempt_id = attempt.id,
                        connector_id = connector.id,
                        credential_id = credential.id,
                        "created index attempt"
                    );
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    async fn attempt_due(&self, connector: &Connector, credential: &Credential, now: DateTime<Utc>) -> Result<bool> {
        let attempts = self
            .catalog
            .list_attempts_for_pair(connector.id, credential.id)
            .await?;
        let queued = attempts.iter().any(|a| {
            matches!(a.status, AttemptStatus::NotStarted | AttemptStatus::InProgress)
        });
        if queued {
            return Ok(false);
        }

        let Some(last) = self
            .catalog
            .last_successful_attempt(connector.id, credential.id)
            .await?
        else {
            return Ok(true);
        };
        Ok(match connector.refresh_freq_secs {
            Some(freq) => (now - last.updated_at).num_seconds() >= freq,
            None => false,
        })
    }

    /// Run every `not_started` attempt, oldest first. An attempt that cannot
    /// run is logged and counted as failed; the rest still run.
    pub async fn execute_pending(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for attempt in self
            .catalog
            .list_attempts_by_status(AttemptStatus::NotStarted)
            .await?
        {
            match self.run_attempt(&attempt, now).await {
                Ok(AttemptOutcome::Succeeded) => summary.succeeded += 1,
                Ok(AttemptOutcome::Failed) => summary.failed += 1,
                Ok(AttemptOutcome::Skipped) => summary.skipped += 1,
                Err(e) => {
                    error!(attempt_id = attempt.id, error = %format!("{:#}", e), "index attempt could not run");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn run_attempt(&self, attempt: &IndexAttempt, now: DateTime<Utc>) -> Result<AttemptOutcome> {
        let connector = self
            .catalog
            .get_connector(attempt.connector_id)
            .await?
            .with_context(|| format!("connector {} not found", attempt.connector_id))?;
        if connector.input_type == InputType::Event {
            debug!(attempt_id = attempt.id, "skipping event connector");
            return Ok(AttemptOutcome::Skipped);
        }

        self.transition(attempt, AttemptStatus::InProgress, None, now).await?;
        info!(
            attempt_id = attempt.id,
            connector_id = connector.id,
            credential_id = attempt.credential_id,
            input_type = %connector.input_type,
            "index attempt started"
        );

        // Past this point every error fails the attempt.
        match self.index_attempt(attempt, &connector, now).await {
            Ok(net_new) => {
                info!(attempt_id = attempt.id, net_new, "index attempt succeeded");
                Ok(AttemptOutcome::Succeeded)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                error!(attempt_id = attempt.id, error = %message, "index attempt failed");
                self.transition(attempt, AttemptStatus::Failed, Some(&message), now)
                    .await?;
                Ok(AttemptOutcome::Failed)
            }
        }
    }

    /// Body of an `in_progress` attempt; returns net new documents.
    async fn index_attempt(
        &self,
        attempt: &IndexAttempt,
        connector: &Connector,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let credential = self
            .catalog
            .get_credential(attempt.credential_id)
            .await?
            .with_context(|| format!("credential {} not found", attempt.credential_id))?;

        let (mut handle, refreshed) = match self.instantiate(connector, &credential).await {
            Ok(started) => started,
            Err(e) => {
                error!(connector_id = connector.id, error = %format!("{:#}", e), "connector failed to start, disabling");
                self.catalog.disable_connector(connector.id).await?;
                return Err(e.context("connector failed to start"));
            }
        };
        if let Some(refreshed) = refreshed {
            self.catalog
                .update_credential_json(credential.id, &refreshed)
                .await
                .context("saving refreshed credentials failed")?;
        }

        let net_new = self.index_all(connector, &credential, &mut handle, now).await?;
        self.catalog
            .transition_attempt(attempt.id, AttemptStatus::Success, None, now)
            .await?;
        self.catalog
            .record_pair_success(connector.id, credential.id, now, net_new as i64)
            .await?;
        Ok(net_new)
    }

    /// Move the attempt and its pair to `status`.
    async fn transition(
        &self,
        attempt: &IndexAttempt,
        status: AttemptStatus,
        error_msg: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.catalog
            .transition_attempt(attempt.id, status, error_msg, now)
            .await?;
        self.catalog
            .update_pair_status(attempt.connector_id, attempt.credential_id, status)
            .await
    }

    /// Build the connector and load its credentials. Returns refreshed
    /// credentials the connector wants stored.
    async fn instantiate(
        &self,
        connector: &Connector,
        credential: &Credential,
    ) -> Result<(ConnectorHandle, Option<serde_json::Value>)> {
        let mut handle = self
            .connectors
            .build(connector.source, connector.input_type, &connector.config)?;
        let refreshed = handle
            .load_credentials(&credential.credential_json)
            .await
            .context("loading credentials failed")?;
        Ok((handle, refreshed))
    }

    /// Drive the connector and index every batch; returns net new documents.
    async fn index_all(
        &self,
        connector: &Connector,
        credential: &Credential,
        handle: &mut ConnectorHandle,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let org = self
            .catalog
            .get_organization(&connector.org_id)
            .await?
            .with_context(|| format!("organization '{}' not found", connector.org_id))?;
        let pipeline = IndexingPipeline::new(
            self.chunking.clone(),
            self.embed_batch_size,
            self.embedder.clone(),
            self.indexes.vector(&org.vector_collection),
            self.indexes.keyword(&org.keyword_collection),
        );

        let window_start = self
            .catalog
            .get_pair(connector.id, credential.id)
            .await?
            .and_then(|p| p.last_successful_index_time)
            .unwrap_or_default();

        let Some(mut batches) = handle.scheduled_batches(window_start, now) else {
            bail!("event connectors are not scheduled");
        };

        let user = credential.effective_user();
        let mut net_new = 0;
        while let Some(batch) = batches.next().await {
            let documents = batch.context("connector failed to yield documents")?;
            let outcome = pipeline.index(&documents, user).await?;
            debug!(
                connector_id = connector.id,
                documents = documents.len(),
                chunks = outcome.chunk_count,
                "indexed batch"
            );
            net_new += outcome.net_new_documents;
        }
        Ok(net_new)
    }

    /// Recovery, creation and execution at `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let recovered = self.recover(now).await?;
        let mut summary = self.tick(now).await?;
        summary.recovered = recovered;
        Ok(summary)
    }

    async fn tick(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let created = self.create_attempts(now).await?;
        let mut summary = self.execute_pending(now).await?;
        summary.created = created;
        Ok(summary)
    }

    /// Recover once, then create and execute attempts every `interval`.
    pub async fn run_forever(&self, interval: Duration) -> Result<()> {
        let recovered = self.recover(Utc::now()).await?;
        if recovered > 0 {
            warn!(recovered, "recovered orphaned attempts");
        }
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.tick(Utc::now()).await {
                Ok(summary) if summary.created + summary.succeeded + summary.failed > 0 => {
                    info!(
                        created = summary.created,
                        succeeded = summary.succeeded,
                        failed = summary.failed,
                        "runner pass complete"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %format!("{:#}", e), "runner pass failed"),
            }
        }
    }
}
