//! Answerability judgement: can the supplied documents answer the query,
//! and how confident is the model?
//!
//! Parsing is tolerant. JSON is tried first; otherwise a regex picks the
//! first yes/no out of free text, and the confidence is the number following
//! the word "confidence" or else the first number within `[0, 1]`. A field
//! that cannot be recovered is unknown, surfaced as `answerable = false`
//! and `confidence = 0.0`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;

use crate::llm::{LanguageModel, LlmRequest};
use crate::models::InferenceChunk;
use crate::qa::parse::json_object_span;
use crate::qa::prompt::build_verify_prompt;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Verification {
    pub answerable: bool,
    pub confidence: f64,
}

fn yes_no_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(yes|no)\b").expect("valid regex"))
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"))
}

fn labelled_confidence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)confidence[a-z_ ]*[:=]?\s*(\d+(?:\.\d+)?)").expect("valid regex")
    })
}

fn free_text_confidence(raw: &str) -> Option<f64> {
    if let Some(value) = labelled_confidence_regex()
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
    {
        return Some(value);
    }
    number_regex()
        .find_iter(raw)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .find(|c| (0.0..=1.0).contains(c))
}

fn yes_no(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" => Some(true),
        "no" | "false" => Some(false),
        _ => None,
    }
}

fn parse_json_verification(raw: &str) -> Option<(Option<bool>, Option<f64>)> {
    let value: Value = serde_json::from_str(json_object_span(raw)?).ok()?;
    let obj = value.as_object()?;
    let answerable = match obj.get("answerable")? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => yes_no(s),
        _ => None,
    };
    let confidence = match obj.get("confidence_score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Some((answerable, confidence))
}

pub fn parse_verification(raw: &str) -> Verification {
    let (answerable, confidence) = parse_json_verification(raw).unwrap_or_else(|| {
        let answerable = yes_no_regex()
            .captures(raw)
            .and_then(|c| c.get(1))
            .and_then(|m| yes_no(m.as_str()));
        (answerable, free_text_confidence(raw))
    });

    Verification {
        answerable: answerable.unwrap_or(false),
        confidence: confidence
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0))
            .unwrap_or(0.0),
    }
}

#[derive(Debug, Clone)]
pub struct VerifyParams {
    pub token_budget: usize,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl Default for VerifyParams {
    fn default() -> Self {
        Self {
            token_budget: 4096 - 64,
            max_tokens: 64,
            timeout: crate::llm::DEFAULT_MODEL_TIMEOUT,
        }
    }
}

pub struct VerifyChain {
    model: Arc<dyn LanguageModel>,
    params: VerifyParams,
}

impl VerifyChain {
    pub fn new(model: Arc<dyn LanguageModel>, params: VerifyParams) -> Self {
        Self { model, params }
    }

    /// Ask the model whether `chunks` answer `query`. Temperature is 0.
    pub async fn verify(&self, query: &str, chunks: &[InferenceChunk]) -> Result<Verification> {
        let prompt = build_verify_prompt(query, chunks, self.params.token_budget);
        let request = LlmRequest::new(prompt.text)
            .with_temperature(0.0)
            .with_max_tokens(self.params.max_tokens)
            .with_timeout(self.params.timeout);
        let raw = self
            .model
            .complete(&request)
            .await
            .with_context(|| format!("verify call to {} failed", self.model.name()))?;
        Ok(parse_verification(&raw))
    }
}
