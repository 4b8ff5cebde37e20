//! Prompt assembly for the answer and verify chains.

use crate::models::InferenceChunk;
use crate::tokens::count_tokens;

/// Separator placed before every document in a prompt.
pub const DOC_SEP: &str = "---NEW DOCUMENT---";

const QA_INSTRUCTIONS: &str = "You are a question answering assistant. Answer the query using \
only the documents below. Respond with a single JSON object of the form \
{\"answer\": \"<answer>\", \"quotes\": [\"<quote>\", ...]}. Every quote must be copied \
EXACTLY from one of the documents. If the documents do not contain the answer, respond with \
{\"answer\": null, \"quotes\": []}.";

const VERIFY_INSTRUCTIONS: &str = "Decide whether the documents below contain enough \
information to answer the query. Respond with a single JSON object of the form \
{\"answerable\": \"Yes\" or \"No\", \"confidence_score\": <number between 0 and 1>}.";

/// An assembled prompt and how many documents made it in.
#[derive(Debug, Clone, PartialEq)]
pub struct StuffedPrompt {
    pub text: String,
    pub documents_used: usize,
}

/// Instructions, then documents in the given order while the running token
/// count stays below `token_budget`, then the query.
fn stuff_documents(
    instructions: &str,
    query: &str,
    chunks: &[InferenceChunk],
    token_budget: usize,
) -> StuffedPrompt {
    let tail = format!("\n\nQuery: {}\n", query.trim());
    let mut used_tokens = count_tokens(instructions) + count_tokens(&tail);
    let mut body = String::new();
    let mut documents_used = 0;

    for chunk in chunks {
        let section = format!("\n\n{}\n{}", DOC_SEP, chunk.content);
        let cost = count_tokens(&section);
        if used_tokens + cost >= token_budget {
            break;
        }
        used_tokens += cost;
        body.push_str(&section);
        documents_used += 1;
    }

    StuffedPrompt {
        text: format!("{}{}{}", instructions, body, tail),
        documents_used,
    }
}

pub fn build_qa_prompt(query: &str, chunks: &[InferenceChunk], token_budget: usize) -> StuffedPrompt {
    stuff_documents(QA_INSTRUCTIONS, query, chunks, token_budget)
}

pub fn build_verify_prompt(
    query: &str,
    chunks: &[InferenceChunk],
    token_budget: usize,
) -> StuffedPrompt {
    stuff_documents(VERIFY_INSTRUCTIONS, query, chunks, token_budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentSource, SearchType};
    use std::collections::BTreeMap;

    fn chunk(content: &str) -> InferenceChunk {
        InferenceChunk {
            document_id: "d".to_string(),
            chunk_id: 0,
            content: content.to_string(),
            blurb: String::new(),
            source_links: BTreeMap::new(),
            section_continuation: false,
            source_type: DocumentSource::Web,
            semantic_identifier: "d".to_string(),
            metadata: BTreeMap::new(),
            score: None,
            rerank_score: None,
            search_type: SearchType::Semantic,
        }
    }

    #[test]
    fn test_documents_separated_in_order() {
        let chunks = vec![chunk("first doc"), chunk("second doc")];
        let prompt = build_qa_prompt("q?", &chunks, 10_000);
        assert_eq!(prompt.documents_used, 2);
        assert_eq!(prompt.text.matches(DOC_SEP).count(), 2);
        let first = prompt.text.find("first doc").unwrap();
        let second = prompt.text.find("second doc").unwrap();
        assert!(first < second);
        assert!(prompt.text.trim_end().ends_with("Query: q?"));
    }

    #[test]
    fn test_budget_stops_greedy_fill() {
        let big = "x".repeat(400);
        let chunks = vec![chunk(&big), chunk(&big), chunk(&big)];
        let base = count_tokens(QA_INSTRUCTIONS) + count_tokens("\n\nQuery: q\n");
        let per_doc = count_tokens(&format!("\n\n{}\n{}", DOC_SEP, big));
        let prompt = build_qa_prompt("q", &chunks, base + 2 * per_doc + 1);
        assert_eq!(prompt.documents_used, 2);
        assert!(count_tokens(&prompt.text) <= base + 2 * per_doc + 1);
    }

    #[test]
    fn test_nothing_fits() {
        let prompt = build_verify_prompt("q", &[chunk("some content")], 1);
        assert_eq!(prompt.documents_used, 0);
        assert!(!prompt.text.contains(DOC_SEP));
    }
}
