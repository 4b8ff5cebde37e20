//! Answer chain: stuff reranked chunks into a JSON-constrained prompt,
//! parse the reply, and attribute quotes to their sources.
//!
//! [`answer_and_verify`] runs this chain and the verify chain concurrently
//! on the same evidence. A failing task is logged with its name and
//! does not cancel the other; only when both fail is the outcome empty.

pub mod parse;
pub mod prompt;
pub mod quotes;
pub mod stream;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use tracing::error;

use crate::error::CoreError;
use crate::llm::{LanguageModel, LlmRequest, TokenStream, DEFAULT_MODEL_TIMEOUT};
use crate::models::InferenceChunk;
use crate::verify::{Verification, VerifyChain};

use self::parse::parse_answer;
use self::prompt::build_qa_prompt;
use self::quotes::{match_quotes_to_docs, AttributedQuote, DEFAULT_QUOTE_PREFIX_CHARS};
use self::stream::AnswerStreamExtractor;

#[derive(Debug, Clone)]
pub struct QaParams {
    pub context_length: usize,
    /// Tokens kept free for the model's reply.
    pub reserved_output_tokens: usize,
    pub temperature: f32,
    pub timeout: Duration,
    /// Leading characters of each quote used for source matching.
    pub quote_prefix_chars: usize,
}

impl Default for QaParams {
    fn default() -> Self {
        Self {
            context_length: 4096,
            reserved_output_tokens: 1024,
            temperature: 0.0,
            timeout: DEFAULT_MODEL_TIMEOUT,
            quote_prefix_chars: DEFAULT_QUOTE_PREFIX_CHARS,
        }
    }
}

impl QaParams {
    /// Tokens available for instructions, documents and query.
    pub fn prompt_budget(&self) -> usize {
        self.context_length.saturating_sub(self.reserved_output_tokens)
    }
}

/// Parsed answer with attributed quotes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QaAnswer {
    pub answer: Option<String>,
    pub quotes: Option<Vec<AttributedQuote>>,
}

/// Events of a streamed answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QaEvent {
    /// Decoded answer text as it arrives.
    AnswerData { text: String },
    /// Attributed quotes, once the reply is complete.
    Quotes { quotes: Vec<AttributedQuote> },
    /// The fully parsed answer; always last.
    Final { answer: QaAnswer },
}

pub struct QaChain {
    model: Arc<dyn LanguageModel>,
    params: QaParams,
}

impl QaChain {
    pub fn new(model: Arc<dyn LanguageModel>, params: QaParams) -> Self {
        Self { model, params }
    }

    pub fn params(&self) -> &QaParams {
        &self.params
    }

    fn request(&self, query: &str, chunks: &[InferenceChunk]) -> (LlmRequest, usize) {
        let prompt = build_qa_prompt(query, chunks, self.params.prompt_budget());
        let request = LlmRequest::new(prompt.text)
            .with_temperature(self.params.temperature)
            .with_max_tokens(self.params.reserved_output_tokens)
            .with_timeout(self.params.timeout);
        (request, prompt.documents_used)
    }

    /// Parse a raw reply and attribute its quotes to `chunks`.
    pub fn interpret(&self, raw: &str, chunks: &[InferenceChunk]) -> QaAnswer {
        let parsed = parse_answer(raw);
        let quotes = parsed
            .quotes
            .map(|q| match_quotes_to_docs(&q, chunks, self.params.quote_prefix_chars));
        QaAnswer {
            answer: parsed.answer,
            quotes,
        }
    }

    pub async fn answer(&self, query: &str, chunks: &[InferenceChunk]) -> Result<QaAnswer> {
        let (request, used) = self.request(query, chunks);
        let raw = self
            .model
            .complete(&request)
            .await
            .with_context(|| format!("QA call to {} failed", self.model.name()))?;
        Ok(self.interpret(&raw, &chunks[..used]))
    }

    /// Stream the answer text as the model produces it, then the quotes and
    /// the final parse. Dropping the stream cancels the model call.
    pub async fn answer_stream(
        &self,
        query: &str,
        chunks: Vec<InferenceChunk>,
    ) -> Result<BoxStream<'static, Result<QaEvent>>> {
        let (request, used) = self.request(query, &chunks);
        let tokens = self
            .model
            .stream(&request)
            .await
            .with_context(|| format!("QA stream from {} failed", self.model.name()))?;

        let mut chunks = chunks;
        chunks.truncate(used);
        let state = StreamState {
            tokens,
            extractor: AnswerStreamExtractor::new(),
            chunks,
            prefix_chars: self.params.quote_prefix_chars,
            pending: VecDeque::new(),
            finished: false,
        };

        Ok(futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.pending.pop_front() {
                    return Some((event, st));
                }
                if st.finished {
                    return None;
                }
                match st.tokens.next().await {
                    Some(Ok(token)) => {
                        if let Some(text) = st.extractor.push(&token) {
                            st.pending.push_back(Ok(QaEvent::AnswerData { text }));
                        }
                    }
                    Some(Err(e)) => {
                        st.finished = true;
                        st.pending.push_back(Err(e.context("QA stream interrupted")));
                    }
                    None => {
                        st.finished = true;
                        st.finish();
                    }
                }
            }
        })
        .boxed())
    }
}

struct StreamState {
    tokens: TokenStream,
    extractor: AnswerStreamExtractor,
    chunks: Vec<InferenceChunk>,
    prefix_chars: usize,
    pending: VecDeque<Result<QaEvent>>,
    finished: bool,
}

impl StreamState {
    fn finish(&mut self) {
        let parsed = parse_answer(self.extractor.raw());
        if !self.extractor.emitted_any() {
            if let Some(answer) = &parsed.answer {
                self.pending.push_back(Ok(QaEvent::AnswerData {
                    text: answer.clone(),
                }));
            }
        }
        let quotes = parsed
            .quotes
            .map(|q| match_quotes_to_docs(&q, &self.chunks, self.prefix_chars));
        self.pending.push_back(Ok(QaEvent::Quotes {
            quotes: quotes.clone().unwrap_or_default(),
        }));
        self.pending.push_back(Ok(QaEvent::Final {
            answer: QaAnswer {
                answer: parsed.answer,
                quotes,
            },
        }));
    }
}

/// Answer and verification of one query.
#[derive(Debug, Default)]
pub struct JointAnswer {
    pub answer: Option<String>,
    pub quotes: Option<Vec<AttributedQuote>>,
    pub answerable: Option<bool>,
    pub confidence: Option<f64>,
    /// Why the answer task failed, if it did.
    pub qa_error: Option<anyhow::Error>,
}

impl JointAnswer {
    /// Both tasks failed: nothing to report.
    pub fn is_empty(&self) -> bool {
        self.answer.is_none()
            && self.quotes.is_none()
            && self.answerable.is_none()
            && self.confidence.is_none()
    }
}

fn task_failed(task: &str, err: anyhow::Error) -> anyhow::Error {
    let message = format!("{:#}", err);
    error!(task, error = %message, "chain task failed");
    err.context(CoreError::TaskFailed {
        task: task.to_string(),
        message,
    })
}

/// Run the answer and verify chains concurrently on the same evidence.
pub async fn answer_and_verify(
    qa: &QaChain,
    verify: &VerifyChain,
    query: &str,
    chunks: &[InferenceChunk],
) -> JointAnswer {
    let (answer, verdict) = futures::join!(qa.answer(query, chunks), verify.verify(query, chunks));

    let mut joint = JointAnswer::default();
    match answer {
        Ok(a) => {
            joint.answer = a.answer;
            joint.quotes = a.quotes;
        }
        Err(e) => joint.qa_error = Some(task_failed("qa", e)),
    }
    match verdict {
        Ok(Verification {
            answerable,
            confidence,
        }) => {
            joint.answerable = Some(answerable);
            joint.confidence = Some(confidence);
        }
        Err(e) => {
            task_failed("verify", e);
        }
    }
    joint
}
