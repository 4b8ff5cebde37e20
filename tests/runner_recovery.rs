//! Connector runner start-up recovery and pair bookkeeping.

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use mimic::catalog::{AttemptStatus, Catalog, NewConnector, SqliteCatalog};
use mimic::connectors::ConnectorFactory;
use mimic::runner::Runner;
use mimic::sqlite_index::SqliteIndexFactory;
use mimic_core::chunk::ChunkingParams;
use mimic_core::connector::{ConnectorHandle, InputType, StaticConnector};
use mimic_core::embedding::HashingEmbedder;
use mimic_core::models::{Document, DocumentSource, Section};

fn doc(id: &str) -> Document {
    Document {
        id: id.to_string(),
        sections: vec![Section::new(format!("https://wiki/{}", id), format!("page {} body", id))],
        source: DocumentSource::Confluence,
        semantic_identifier: id.to_string(),
        metadata: BTreeMap::new(),
        updated_at: None,
    }
}

async fn setup() -> (TempDir, Arc<SqliteCatalog>, Runner) {
    let dir = TempDir::new().unwrap();
    let pool = mimic::db::connect_path(&dir.path().join("runner.sqlite"))
        .await
        .unwrap();
    mimic::migrate::apply_schema(&pool).await.unwrap();
    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    catalog.upsert_organization("acme", "Acme").await.unwrap();

    let mut factory = ConnectorFactory::new();
    factory.register(
        DocumentSource::Confluence,
        &[InputType::LoadState],
        Arc::new(|_: InputType, _: &Value| -> Result<ConnectorHandle> {
            Ok(ConnectorHandle::Load(Box::new(StaticConnector::new(vec![
                vec![doc("p1"), doc("p2")],
                vec![doc("p3")],
            ]))))
        }),
    );

    let runner = Runner::new(
        catalog.clone(),
        Arc::new(factory),
        Arc::new(SqliteIndexFactory::new(pool, 64)),
        Arc::new(HashingEmbedder::new(32)),
        ChunkingParams::default(),
        8,
    );
    (dir, catalog, runner)
}

async fn add_pair(catalog: &SqliteCatalog, refresh: Option<i64>) -> (i64, i64) {
    let connector = catalog
        .create_connector(NewConnector {
            org_id: "acme".to_string(),
            name: "wiki".to_string(),
            source: DocumentSource::Confluence,
            input_type: InputType::LoadState,
            config: serde_json::json!({}),
            refresh_freq_secs: refresh,
        })
        .await
        .unwrap();
    let credential = catalog
        .create_credential(Some("u1"), false, &serde_json::json!({"token": "secret"}))
        .await
        .unwrap();
    catalog.link_pair(connector.id, credential.id).await.unwrap();
    (connector.id, credential.id)
}

#[tokio::test]
async fn test_in_progress_attempt_recovered_at_startup() {
    let (_dir, catalog, runner) = setup().await;
    let (connector_id, credential_id) = add_pair(&catalog, Some(600)).await;

    let crashed_at = Utc::now() - Duration::hours(2);
    let orphan = catalog
        .create_attempt(connector_id, credential_id, crashed_at)
        .await
        .unwrap();
    catalog
        .transition_attempt(orphan.id, AttemptStatus::InProgress, None, crashed_at)
        .await
        .unwrap();

    let now = Utc::now();
    assert_eq!(runner.recover(now).await.unwrap(), 1);
    let orphan = catalog.get_attempt(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, AttemptStatus::Failed);
    assert!(orphan.error_msg.is_some());

    assert_eq!(runner.create_attempts(now).await.unwrap(), 1);
    let queued = catalog
        .list_attempts_by_status(AttemptStatus::NotStarted)
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].connector_id, connector_id);
    assert_eq!(queued[0].credential_id, credential_id);

    let summary = runner.execute_pending(now).await.unwrap();
    assert_eq!(summary.succeeded, 1);
    let pair = catalog.get_pair(connector_id, credential_id).await.unwrap().unwrap();
    assert_eq!(pair.last_attempt_status, Some(AttemptStatus::Success));
    assert_eq!(pair.total_docs_indexed, 3);
}

#[tokio::test]
async fn test_docs_indexed_total_never_decreases() {
    let (_dir, catalog, runner) = setup().await;
    let (connector_id, credential_id) = add_pair(&catalog, Some(60)).await;

    let start = Utc::now();
    let mut previous = 0;
    for round in 0..3 {
        runner
            .run_once(start + Duration::seconds(120 * round))
            .await
            .unwrap();
        let pair = catalog.get_pair(connector_id, credential_id).await.unwrap().unwrap();
        assert!(pair.total_docs_indexed >= previous);
        previous = pair.total_docs_indexed;
    }
    assert_eq!(previous, 3);

    let attempts = catalog
        .list_attempts_for_pair(connector_id, credential_id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.status == AttemptStatus::Success));
}
