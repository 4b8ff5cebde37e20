//! OpenAI-compatible chat completions client.
//!
//! Implements [`LanguageModel`] against `/chat/completions`. Non-streaming
//! calls return `choices[0].message.content`; streaming calls parse the
//! server-sent `data:` lines into content deltas until `[DONE]`.
//!
//! Every call is bounded by the request's timeout: the whole exchange for
//! `complete`, and each read of the stream against one deadline for
//! `stream`. An elapsed deadline surfaces as [`CoreError::Timeout`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use mimic_core::error::CoreError;
use mimic_core::llm::{LanguageModel, LlmRequest, TokenStream};

use crate::config::LlmConfig;
use crate::http::send_with_retry;

pub struct OpenAIChatModel {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl OpenAIChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            endpoint: chat_endpoint(&config.base_url),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    fn body(&self, request: &LlmRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        send_with_retry("llm", self.max_retries, || {
            let mut req = self.client.post(&self.endpoint).json(body);
            if let Some(key) = &self.api_key {
                req = req.header("Authorization", format!("Bearer {}", key));
            }
            req
        })
        .await
    }
}

/// Resolve the chat completions endpoint from the base URL.
pub fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{}/chat/completions", base)
    } else {
        format!("{}/v1/chat/completions", base)
    }
}

async fn with_deadline<T>(
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout(timeout).into()),
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let body = self.body(request, false);
        with_deadline(request.timeout, async {
            let response = self.send(&body).await?;
            let json: serde_json::Value = response.json().await.map_err(|e| {
                CoreError::provider(self.model.as_str(), format!("Failed to parse LLM JSON: {}", e))
            })?;
            parse_completion(&json)
        })
        .await
    }

    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        let deadline = Instant::now() + request.timeout;
        let body = self.body(request, true);
        let response = with_deadline(request.timeout, self.send(&body)).await?;

        let state = SseState {
            bytes: response
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()))
                .boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
            deadline,
            timeout: request.timeout,
        };
        Ok(stream::unfold(state, next_delta).boxed())
    }
}

/// `choices[0].message.content` of a completion; a null content is empty.
fn parse_completion(json: &serde_json::Value) -> Result<String> {
    let choice = json
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| CoreError::provider("llm", "response has no choices"))?;
    Ok(choice["message"]["content"]
        .as_str()
        .unwrap_or("")
        .to_string())
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(json) = serde_json::from_str::<serde_json::Value>(payload) else {
        return SseLine::Skip;
    };
    match json["choices"][0]["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Skip,
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
    deadline: Instant,
    timeout: Duration,
}

impl SseState {
    /// Move every complete line out of the buffer into `pending`.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Delta(text) => self.pending.push_back(text),
                SseLine::Done => {
                    self.done = true;
                    self.buffer.clear();
                    return;
                }
                SseLine::Skip => {}
            }
        }
    }
}

async fn next_delta(mut st: SseState) -> Option<(Result<String>, SseState)> {
    loop {
        if let Some(text) = st.pending.pop_front() {
            return Some((Ok(text), st));
        }
        if st.done {
            return None;
        }
        match tokio::time::timeout_at(st.deadline, st.bytes.next()).await {
            Err(_) => {
                st.done = true;
                return Some((Err(CoreError::Timeout(st.timeout).into()), st));
            }
            Ok(Some(Ok(bytes))) => {
                st.buffer.extend_from_slice(&bytes);
                st.drain_lines();
            }
            Ok(Some(Err(e))) => {
                st.done = true;
                let err = CoreError::provider("llm", format!("stream read failed: {}", e));
                return Some((Err(err.into()), st));
            }
            Ok(None) => {
                // A final line without trailing newline.
                st.buffer.push(b'\n');
                st.drain_lines();
                st.done = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_endpoint() {
        assert_eq!(
            chat_endpoint("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://localhost:1234/"),
            "http://localhost:1234/v1/chat/completions"
        );
        assert_eq!(
            chat_endpoint("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_completion() {
        let json = serde_json::json!({"choices": [{"message": {"content": "Paris"}}]});
        assert_eq!(parse_completion(&json).unwrap(), "Paris");
        let json = serde_json::json!({"choices": [{"message": {"content": null}}]});
        assert_eq!(parse_completion(&json).unwrap(), "");
        let err = parse_completion(&serde_json::json!({})).unwrap_err();
        assert!(mimic_core::error::is_provider_failure(&err));
    }

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Par"}}]}"#),
            SseLine::Delta("Par".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[tokio::test]
    async fn test_sse_state_splits_lines_across_reads() {
        let parts: Vec<reqwest::Result<Vec<u8>>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\ndata: {\"choi".to_vec()),
            Ok(b"ces\":[{\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n".to_vec()),
        ];
        let state = SseState {
            bytes: stream::iter(parts).boxed(),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
            deadline: Instant::now() + Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        };
        let tokens: Vec<String> = stream::unfold(state, next_delta)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["He".to_string(), "llo".to_string()]);
    }
}
