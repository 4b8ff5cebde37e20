//! Style chains: describe how a user writes, rephrase answers in that
//! voice, and shuffle a rephrased answer into an alternative wording.
//!
//! Style generation needs at least `min_chat_pairs` pairs. Rephrasing
//! packs as many example pairs into the prompt as fit the token budget and
//! never fails: without style material, or when the model errors, the
//! draft answer is returned unchanged.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::llm::{LanguageModel, LlmRequest, DEFAULT_MODEL_TIMEOUT};
use crate::tokens::count_tokens;

/// Separator between chat-pair examples in style prompts.
pub const EXAMPLE_SEP: &str = "---NEW EXAMPLE---";
/// Context placeholder when no evidence backs the answer.
pub const NULL_DOC: &str = "NULL_DOC";

/// An incoming message and the user's reply to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPair {
    pub message: String,
    pub reply: String,
}

impl ChatPair {
    pub fn new(message: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            reply: reply.into(),
        }
    }

    fn render(&self) -> String {
        format!("{}\nMessage: {}\nReply: {}\n", EXAMPLE_SEP, self.message, self.reply)
    }
}

#[derive(Debug, Clone)]
pub struct StyleParams {
    /// Fewest pairs from which a style description is generated.
    pub min_chat_pairs: usize,
    /// Token budget of a rephrase prompt.
    pub max_prompt_tokens: usize,
    /// Draft used when there is no answer.
    pub not_sure_message: String,
    pub shuffle_temperature: f32,
    pub max_output_tokens: usize,
    pub timeout: Duration,
}

impl Default for StyleParams {
    fn default() -> Self {
        Self {
            min_chat_pairs: 5,
            max_prompt_tokens: 3000,
            not_sure_message: "I'm not sure".to_string(),
            shuffle_temperature: 0.9,
            max_output_tokens: 512,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// Inputs of a rephrase call.
#[derive(Debug, Clone, Copy)]
pub struct RephraseInput<'a> {
    pub pairs: &'a [ChatPair],
    pub style: Option<&'a str>,
    pub query: &'a str,
    /// Display name or id of the user being imitated.
    pub user: &'a str,
    /// The answer to rephrase; `None` means there is no answer.
    pub answer: Option<&'a str>,
    /// Supporting document text; `None` is rendered as [`NULL_DOC`].
    pub context: Option<&'a str>,
}

pub fn build_style_prompt(pairs: &[ChatPair]) -> String {
    let mut prompt = String::from(
        "Below are messages a person received and the replies they wrote. Describe their tone \
         attributes and conversation style (formality, length, vocabulary, punctuation, emoji, \
         humour) so that someone else could write exactly like them.\n\n",
    );
    for pair in pairs {
        prompt.push_str(&pair.render());
    }
    prompt.push_str("\nTone attributes / conversation style:");
    prompt
}

/// Rephrase prompt and the number of example pairs that fit.
pub fn build_rephrase_prompt(input: &RephraseInput<'_>, draft: &str, max_tokens: usize) -> (String, usize) {
    let head = format!(
        "You are {user}. Rewrite the draft answer below so it reads as if {user} wrote it, \
         keeping every fact unchanged. Do not add information.\n\n\
         Conversation style of {user}:\n{style}\n\nExamples of how {user} replies:\n",
        user = input.user,
        style = input.style.unwrap_or("(unknown)"),
    );
    let tail = format!(
        "\nDocuments:\n{context}\n\nQuestion: {query}\nDraft answer: {draft}\n\nRewritten answer:",
        context = input.context.unwrap_or(NULL_DOC),
        query = input.query,
        draft = draft,
    );

    let mut used = count_tokens(&head) + count_tokens(&tail);
    let mut examples = String::new();
    let mut fitted = 0;
    for pair in input.pairs {
        let rendered = pair.render();
        let cost = count_tokens(&rendered);
        if used + cost > max_tokens {
            break;
        }
        used += cost;
        examples.push_str(&rendered);
        fitted += 1;
    }

    (format!("{}{}{}", head, examples, tail), fitted)
}

pub fn build_shuffle_prompt(answer: &str, style: Option<&str>) -> String {
    format!(
        "Write a creative variation of the reply below. Keep its meaning and facts, change the \
         wording, and stay in this conversation style:\n{}\n\nReply: {}\n\nVariation:",
        style.unwrap_or("(same as the reply)"),
        answer
    )
}

#[derive(Clone)]
pub struct StyleChain {
    model: Arc<dyn LanguageModel>,
    params: StyleParams,
}

impl StyleChain {
    pub fn new(model: Arc<dyn LanguageModel>, params: StyleParams) -> Self {
        Self { model, params }
    }

    pub fn params(&self) -> &StyleParams {
        &self.params
    }

    fn request(&self, prompt: String, temperature: f32) -> LlmRequest {
        LlmRequest::new(prompt)
            .with_temperature(temperature)
            .with_max_tokens(self.params.max_output_tokens)
            .with_timeout(self.params.timeout)
    }

    /// Describe the style shown by `pairs`. `None` when there are fewer
    /// than `min_chat_pairs`.
    pub async fn generate_style(&self, pairs: &[ChatPair]) -> Result<Option<String>> {
        if pairs.len() < self.params.min_chat_pairs {
            return Ok(None);
        }
        let request = self.request(build_style_prompt(pairs), 0.0);
        let style = self
            .model
            .complete(&request)
            .await
            .context("style generation failed")?;
        let style = style.trim();
        Ok((!style.is_empty()).then(|| style.to_string()))
    }

    /// Rephrase the answer (or the not-sure message) in the user's voice.
    pub async fn rephrase(&self, input: &RephraseInput<'_>) -> String {
        let draft = input
            .answer
            .unwrap_or(self.params.not_sure_message.as_str());
        let input = RephraseInput {
            context: if input.answer.is_some() { input.context } else { None },
            ..*input
        };
        if input.style.is_none() && input.pairs.is_empty() {
            return draft.to_string();
        }

        let (prompt, _) = build_rephrase_prompt(&input, draft, self.params.max_prompt_tokens);
        match self.model.complete(&self.request(prompt, 0.0)).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => draft.to_string(),
            Err(e) => {
                warn!(error = %e, "rephrase failed, returning draft");
                draft.to_string()
            }
        }
    }

    /// A creative variant of `answer` at high temperature.
    pub async fn shuffle(&self, answer: &str, style: Option<&str>) -> Result<String> {
        let request = self.request(build_shuffle_prompt(answer, style), self.params.shuffle_temperature);
        let text = self
            .model
            .complete(&request)
            .await
            .context("shuffle failed")?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::FnModel;

    fn pairs(n: usize) -> Vec<ChatPair> {
        (0..n)
            .map(|i| ChatPair::new(format!("question {}", i), format!("yep {} lol", i)))
            .collect()
    }

    fn input<'a>(pairs: &'a [ChatPair], style: Option<&'a str>, answer: Option<&'a str>) -> RephraseInput<'a> {
        RephraseInput {
            pairs,
            style,
            query: "Where is the Eiffel Tower?",
            user: "sam",
            answer,
            context: Some("The Eiffel Tower is in Paris."),
        }
    }

    #[tokio::test]
    async fn test_generate_requires_threshold() {
        let model = Arc::new(FnModel::replying("casual, lowercase"));
        let chain = StyleChain::new(model.clone(), StyleParams::default());
        assert_eq!(chain.generate_style(&pairs(4)).await.unwrap(), None);
        assert!(model.prompts().is_empty());

        let style = chain.generate_style(&pairs(5)).await.unwrap();
        assert_eq!(style.as_deref(), Some("casual, lowercase"));
        assert_eq!(model.prompts()[0].matches(EXAMPLE_SEP).count(), 5);
    }

    #[test]
    fn test_rephrase_prompt_budgets_pairs() {
        let many = pairs(200);
        let i = input(&many, Some("terse"), Some("Paris."));
        let (_, all) = build_rephrase_prompt(&i, "Paris.", 100_000);
        assert_eq!(all, 200);
        let (prompt, some) = build_rephrase_prompt(&i, "Paris.", 400);
        assert!(some > 0 && some < 200);
        assert!(count_tokens(&prompt) <= 400);
    }

    #[tokio::test]
    async fn test_rephrase_without_style_returns_draft() {
        let model = Arc::new(FnModel::replying("should not be called"));
        let chain = StyleChain::new(model.clone(), StyleParams::default());
        let out = chain.rephrase(&input(&[], None, Some("Paris."))).await;
        assert_eq!(out, "Paris.");
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_no_answer_uses_not_sure_and_null_doc() {
        let model = Arc::new(FnModel::new(|req| {
            assert!(req.prompt.contains(NULL_DOC));
            assert!(req.prompt.contains("Draft answer: I'm not sure"));
            Ok("no clue tbh".to_string())
        }));
        let chain = StyleChain::new(model, StyleParams::default());
        let ps = pairs(5);
        let out = chain.rephrase(&input(&ps, Some("casual"), None)).await;
        assert_eq!(out, "no clue tbh");
    }

    #[tokio::test]
    async fn test_rephrase_model_failure_returns_draft() {
        let model = Arc::new(FnModel::new(|_| Err(anyhow::anyhow!("timeout"))));
        let chain = StyleChain::new(model, StyleParams::default());
        let ps = pairs(5);
        let out = chain.rephrase(&input(&ps, Some("casual"), Some("Paris."))).await;
        assert_eq!(out, "Paris.");
    }

    #[tokio::test]
    async fn test_shuffle_uses_high_temperature() {
        let model = Arc::new(FnModel::replying("  paris, obviously  "));
        let chain = StyleChain::new(model.clone(), StyleParams::default());
        let out = chain.shuffle("Paris.", Some("casual")).await.unwrap();
        assert_eq!(out, "paris, obviously");
        let req = &model.requests.lock().unwrap()[0];
        assert!(req.temperature > 0.5);
    }
}
