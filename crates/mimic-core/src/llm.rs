//! Language model abstraction used by the QA, verify and style chains.
//!
//! The HTTP client lives in the `mimic` crate. Implementations must honour
//! `LlmRequest::timeout` and report an elapsed deadline as
//! [`CoreError::Timeout`](crate::error::CoreError::Timeout).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

/// Default per-call timeout for model requests.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream of text deltas from a model.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.0,
            max_tokens: 1024,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &LlmRequest) -> Result<String>;

    /// Token stream for `request`. The default yields the whole completion
    /// as a single delta. Dropping the stream cancels the call.
    async fn stream(&self, request: &LlmRequest) -> Result<TokenStream> {
        let text = self.complete(request).await?;
        Ok(stream::once(async move { Ok(text) }).boxed())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FnModel;
    use super::*;
    use futures::TryStreamExt;

    #[test]
    fn test_request_builder() {
        let req = LlmRequest::new("hi")
            .with_temperature(0.9)
            .with_max_tokens(64)
            .with_timeout(Duration::from_secs(2));
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.max_tokens, 64);
        assert_eq!(req.timeout, Duration::from_secs(2));
    }

    struct Whole;

    #[async_trait]
    impl LanguageModel for Whole {
        fn name(&self) -> &str {
            "whole"
        }
        async fn complete(&self, _request: &LlmRequest) -> Result<String> {
            Ok("complete text".to_string())
        }
    }

    #[tokio::test]
    async fn test_default_stream_yields_completion() {
        let tokens: Vec<String> = Whole
            .stream(&LlmRequest::new("x"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, vec!["complete text".to_string()]);
    }

    #[tokio::test]
    async fn test_fn_model_streams_in_pieces() {
        let model = FnModel::replying("abcdefg");
        let tokens: Vec<String> = model
            .stream(&LlmRequest::new("x"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(tokens, vec!["abc", "def", "g"]);
        assert_eq!(model.prompts(), vec!["x".to_string()]);
    }
}
