//! Cross-encoder reranker clients.
//!
//! `cohere` posts to a Cohere-compatible `/v1/rerank` endpoint and reads
//! `results[].{index, relevance_score}`. `disabled` scores nothing, so the
//! retriever keeps the fused order.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use mimic_core::error::CoreError;
use mimic_core::retrieval::{NoopReranker, Reranker};

use crate::config::RerankConfig;
use crate::http::send_with_retry;

pub struct CohereReranker {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl CohereReranker {
    pub fn new(config: &RerankConfig) -> Result<Self> {
        let api_key = match std::env::var(&config.api_key_env) {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("{} environment variable not set", config.api_key_env),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Reranker for CohereReranker {
    async fn rerank(&self, query: &str, texts: &[String], top_n: usize) -> Result<Vec<(usize, f64)>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": texts,
            "top_n": top_n.min(texts.len()),
        });
        let response = send_with_retry("cohere", self.max_retries, || {
            self.client
                .post(&self.url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        parse_rerank_response(&json)
    }
}

fn parse_rerank_response(json: &serde_json::Value) -> Result<Vec<(usize, f64)>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| CoreError::provider("cohere", "response has no results array"))?;
    Ok(results
        .iter()
        .filter_map(|item| {
            let index = item.get("index")?.as_u64()? as usize;
            let score = item.get("relevance_score")?.as_f64()?;
            Some((index, score))
        })
        .collect())
}

pub fn create_reranker(config: &RerankConfig) -> Result<Arc<dyn Reranker>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(NoopReranker)),
        "cohere" => Ok(Arc::new(CohereReranker::new(config)?)),
        other => bail!("Unknown rerank provider: {}", other),
    }
}
