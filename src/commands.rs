//! CLI command implementations.
//!
//! Each `cmd_*` function opens the database, does one job, prints a
//! human-readable report to stdout, and closes the pool.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use sqlx::SqlitePool;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mimic_core::connector::InputType;
use mimic_core::models::{DocumentSource, IndexFilters, InferenceChunk};
use mimic_core::pipeline::IndexingPipeline;
use mimic_core::qa::quotes::AttributedQuote;
use mimic_core::style::ChatPair;

use crate::assistant::{Assistant, AssistantEvent, AssistantParams, Providers};
use crate::catalog::{Catalog, NewConnector, SqliteCatalog};
use crate::config::Config;
use crate::connectors::filesystem::document_from_path;
use crate::connectors::ConnectorFactory;
use crate::db;
use crate::embedding::create_provider;
use crate::runner::Runner;
use crate::sqlite_index::{IndexFactory, SqliteIndexFactory};
use crate::styles::StyleStore;

/// Open the pool and make sure the schema exists.
async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;
    Ok(pool)
}

fn index_factory(config: &Config, pool: &SqlitePool) -> Arc<dyn IndexFactory> {
    Arc::new(SqliteIndexFactory::new(
        pool.clone(),
        config.indexing.write_batch_size,
    ))
}

fn build_assistant(config: &Config, pool: &SqlitePool) -> Result<Assistant> {
    Ok(Assistant::new(
        Arc::new(SqliteCatalog::new(pool.clone())),
        index_factory(config, pool),
        StyleStore::new(pool.clone()),
        Providers::from_config(config)?,
        AssistantParams::from_config(config),
    ))
}

/// Filters from CLI flags; absent flags mean no restriction.
pub fn build_filters(sources: &[String], documents: &[String]) -> Result<IndexFilters> {
    let source_types = if sources.is_empty() {
        None
    } else {
        Some(
            sources
                .iter()
                .map(|s| s.parse::<DocumentSource>())
                .collect::<Result<Vec<_>>>()?,
        )
    };
    let document_ids = (!documents.is_empty()).then(|| documents.to_vec());
    Ok(IndexFilters {
        source_types,
        document_ids,
    })
}

pub async fn cmd_org_add(config: &Config, id: &str, name: Option<&str>) -> Result<()> {
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let org = catalog.upsert_organization(id, name.unwrap_or(id)).await?;
    println!("organization {}", org.id);
    println!("  vector collection: {}", org.vector_collection);
    println!("  keyword collection: {}", org.keyword_collection);
    pool.close().await;
    Ok(())
}

pub async fn cmd_user_add(config: &Config, user_id: &str, org_id: &str, name: Option<&str>) -> Result<()> {
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    if catalog.get_organization(org_id).await?.is_none() {
        bail!("Unknown organization: '{}'", org_id);
    }
    catalog.add_user(user_id, org_id, name).await?;
    println!("user {} added to {}", user_id, org_id);
    pool.close().await;
    Ok(())
}

pub struct ConnectorArgs<'a> {
    pub org_id: &'a str,
    pub name: &'a str,
    pub source: &'a str,
    pub input_type: &'a str,
    pub config_json: &'a str,
    pub refresh_secs: Option<i64>,
}

pub async fn cmd_connector_add(config: &Config, args: ConnectorArgs<'_>) -> Result<()> {
    let source: DocumentSource = args.source.parse()?;
    let input_type: InputType = args.input_type.parse()?;
    let connector_config: Value =
        serde_json::from_str(args.config_json).context("--config-json is not valid JSON")?;

    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let connector = catalog
        .create_connector(NewConnector {
            org_id: args.org_id.to_string(),
            name: args.name.to_string(),
            source,
            input_type,
            config: connector_config,
            refresh_freq_secs: args.refresh_secs,
        })
        .await?;
    println!("connector {} created ({} / {})", connector.id, connector.source, connector.input_type);
    pool.close().await;
    Ok(())
}

pub async fn cmd_connector_list(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let connectors = catalog.list_connectors().await?;
    if connectors.is_empty() {
        println!("No connectors.");
    } else {
        println!(
            "{:<4} {:<16} {:<12} {:<12} {:<10} {:<8}",
            "ID", "NAME", "ORG", "SOURCE", "INPUT", "ENABLED"
        );
        for c in connectors {
            println!(
                "{:<4} {:<16} {:<12} {:<12} {:<10} {:<8}",
                c.id,
                c.name,
                c.org_id,
                c.source,
                c.input_type,
                if c.disabled { "no" } else { "yes" }
            );
        }
    }
    pool.close().await;
    Ok(())
}

pub async fn cmd_credential_add(
    config: &Config,
    user_id: Option<&str>,
    public_doc: bool,
    credential_json: &str,
) -> Result<()> {
    if user_id.is_none() && !public_doc {
        bail!("a credential needs --user or --public");
    }
    let json: Value = serde_json::from_str(credential_json).context("--json is not valid JSON")?;
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let credential = catalog.create_credential(user_id, public_doc, &json).await?;
    println!("credential {} created", credential.id);
    pool.close().await;
    Ok(())
}

pub async fn cmd_pair_link(config: &Config, connector_id: i64, credential_id: i64) -> Result<()> {
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    catalog.link_pair(connector_id, credential_id).await?;
    println!("linked connector {} with credential {}", connector_id, credential_id);
    pool.close().await;
    Ok(())
}

pub async fn cmd_run(config: &Config, once: bool) -> Result<()> {
    let pool = open(config).await?;
    let runner = Runner::new(
        Arc::new(SqliteCatalog::new(pool.clone())),
        Arc::new(ConnectorFactory::with_builtins(config.indexing.document_batch_size)),
        index_factory(config, &pool),
        create_provider(&config.embedding)?,
        config.chunking_params(),
        config.embedding.batch_size,
    );
    if once {
        let summary = runner.run_once(Utc::now()).await?;
        println!("run");
        println!("  recovered: {}", summary.recovered);
        println!("  created: {}", summary.created);
        println!("  succeeded: {}", summary.succeeded);
        println!("  failed: {}", summary.failed);
        println!("  skipped: {}", summary.skipped);
        println!("ok");
    } else {
        runner
            .run_forever(Duration::from_secs(config.runner.interval_secs))
            .await?;
    }
    pool.close().await;
    Ok(())
}

pub async fn cmd_status(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let connectors = catalog.list_connectors().await?;
    if connectors.is_empty() {
        println!("No connectors.");
    }
    for connector in connectors {
        println!("{} ({}, {})", connector.name, connector.source, connector.input_type);
        for credential in catalog.credentials_for_connector(connector.id).await? {
            let Some(pair) = catalog.get_pair(connector.id, credential.id).await? else {
                continue;
            };
            let last_success = pair
                .last_successful_index_time
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "  credential {}: status {}, last success {}, docs {}",
                credential.id,
                pair.last_attempt_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                last_success,
                pair.total_docs_indexed
            );
            let attempts = catalog
                .list_attempts_for_pair(connector.id, credential.id)
                .await?;
            for attempt in attempts.iter().rev().take(3) {
                print!("    attempt {} {}", attempt.id, attempt.status);
                if let Some(err) = &attempt.error_msg {
                    print!(": {}", err.replace('\n', " "));
                }
                println!();
            }
        }
    }
    pool.close().await;
    Ok(())
}

fn print_chunks(chunks: &[InferenceChunk]) {
    for (i, chunk) in chunks.iter().enumerate() {
        let score = chunk.rerank_score.or(chunk.score).unwrap_or(0.0);
        println!(
            "{}. [{:.2}] {} / {}",
            i + 1,
            score,
            chunk.source_type,
            chunk.semantic_identifier
        );
        if let Some(link) = chunk.source_links.values().next() {
            println!("    url: {}", link);
        }
        println!("    excerpt: \"{}\"", chunk.blurb.replace('\n', " ").trim());
        println!("    id: {}#{}", chunk.document_id, chunk.chunk_id);
        println!();
    }
}

fn print_quotes(quotes: &[AttributedQuote]) {
    if quotes.is_empty() {
        return;
    }
    println!();
    println!("Quotes:");
    for q in quotes {
        let link = q.source.source_link.as_deref().unwrap_or("-");
        println!("  \"{}\"", q.quote.replace('\n', " "));
        println!("    {} ({})", q.source.semantic_identifier, link);
    }
}

pub async fn cmd_search(
    config: &Config,
    user_id: &str,
    query: &str,
    filters: &IndexFilters,
    limit: usize,
) -> Result<()> {
    let pool = open(config).await?;
    let assistant = build_assistant(config, &pool)?;
    let mut chunks = assistant.search(user_id, query, filters).await?;
    chunks.truncate(limit);
    if chunks.is_empty() {
        println!("No results.");
    } else {
        print_chunks(&chunks);
    }
    pool.close().await;
    Ok(())
}

pub async fn cmd_ask(
    config: &Config,
    user_id: &str,
    query: &str,
    filters: &IndexFilters,
    stream: bool,
) -> Result<()> {
    let pool = open(config).await?;
    let assistant = build_assistant(config, &pool)?;

    if stream {
        let mut events = assistant.ask_stream(user_id, query, filters).await?;
        let mut stdout = std::io::stdout();
        while let Some(event) = events.next().await {
            match event? {
                AssistantEvent::AnswerPiece { text } => {
                    print!("{}", text);
                    stdout.flush()?;
                }
                AssistantEvent::Quotes { quotes } => {
                    println!();
                    print_quotes(&quotes);
                }
                AssistantEvent::Rephrased { text } => println!("\n{}", text),
                AssistantEvent::Verdict {
                    answerable,
                    confidence,
                } => print_verdict(answerable, confidence),
            }
        }
    } else {
        let reply = assistant.ask(user_id, query, filters).await?;
        println!("{}", reply.answer);
        print_quotes(&reply.quotes);
        print_verdict(reply.answerable, reply.confidence);
        println!("  docs relevant: {}", if reply.docs_relevant { "yes" } else { "no" });
    }
    pool.close().await;
    Ok(())
}

fn print_verdict(answerable: Option<bool>, confidence: Option<f64>) {
    println!();
    match (answerable, confidence) {
        (Some(a), Some(c)) => println!("  answerable: {} (confidence {:.2})", if a { "yes" } else { "no" }, c),
        _ => println!("  answerable: unknown"),
    }
}

pub async fn cmd_style_add_pair(config: &Config, user_id: &str, message: &str, reply: &str) -> Result<()> {
    let pool = open(config).await?;
    let store = StyleStore::new(pool.clone());
    store
        .add_chat_pair(user_id, &ChatPair::new(message, reply))
        .await?;
    println!(
        "chat pair stored ({} total)",
        store.chat_pair_count(user_id).await?
    );
    pool.close().await;
    Ok(())
}

pub async fn cmd_style_generate(config: &Config, user_id: &str) -> Result<()> {
    let pool = open(config).await?;
    let assistant = build_assistant(config, &pool)?;
    match assistant.style().regenerate(user_id).await? {
        Some(style) => println!("{}", style),
        None => println!(
            "Not enough chat pairs (need at least {}).",
            config.style.min_chat_pairs
        ),
    }
    pool.close().await;
    Ok(())
}

pub async fn cmd_style_show(config: &Config, user_id: &str) -> Result<()> {
    let pool = open(config).await?;
    let store = StyleStore::new(pool.clone());
    println!("user {}", user_id);
    println!("  chat pairs: {}", store.chat_pair_count(user_id).await?);
    match store.conversation_style(user_id).await? {
        Some(style) => println!("  style: {}", style),
        None => println!("  style: (none)"),
    }
    pool.close().await;
    Ok(())
}

pub async fn cmd_style_shuffle(config: &Config, user_id: &str, answer: &str) -> Result<()> {
    let pool = open(config).await?;
    let assistant = build_assistant(config, &pool)?;
    println!("{}", assistant.style().shuffle(user_id, answer).await?);
    pool.close().await;
    Ok(())
}

/// Index one local file into an organization's collections.
pub async fn cmd_index_file(config: &Config, path: &Path, org_id: &str, user_id: Option<&str>) -> Result<()> {
    let Some(document) = document_from_path(path)? else {
        bail!("{} has no text to index", path.display());
    };
    let pool = open(config).await?;
    let catalog = SqliteCatalog::new(pool.clone());
    let org = catalog
        .get_organization(org_id)
        .await?
        .with_context(|| format!("Unknown organization: '{}'", org_id))?;

    let indexes = index_factory(config, &pool);
    let pipeline = IndexingPipeline::new(
        config.chunking_params(),
        config.embedding.batch_size,
        create_provider(&config.embedding)?,
        indexes.vector(&org.vector_collection),
        indexes.keyword(&org.keyword_collection),
    );
    let outcome = pipeline.index(std::slice::from_ref(&document), user_id).await?;

    println!("index-file {}", path.display());
    println!("  document: {}", document.id);
    println!("  chunks written: {}", outcome.chunk_count);
    println!("  new documents: {}", outcome.net_new_documents);
    println!("ok");
    pool.close().await;
    Ok(())
}
