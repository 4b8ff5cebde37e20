//! Attribute quotes from a model answer to the chunk and section link they
//! were copied from.
//!
//! Both sides are normalised the same way (lowercase, runs of whitespace
//! and punctuation collapsed to one space) so a quote still matches when
//! the model changed spacing, casing or punctuation. The normalised text
//! keeps a map back to byte offsets in the original content; the quote's
//! link is the section link with the greatest offset not after the match.

use serde::{Deserialize, Serialize};

use crate::models::{DocumentSource, InferenceChunk};

/// Default number of leading characters of a quote used for matching.
pub const DEFAULT_QUOTE_PREFIX_CHARS: usize = 100;

/// Where a quote came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteSource {
    pub document_id: String,
    pub source_link: Option<String>,
    pub source_type: DocumentSource,
    pub semantic_identifier: String,
    pub blurb: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributedQuote {
    pub quote: String,
    pub source: QuoteSource,
}

/// Normalised text plus, for every byte of it, the byte offset in the
/// original text it came from.
struct Normalized {
    text: String,
    origin: Vec<usize>,
}

fn normalize(text: &str) -> Normalized {
    let mut out = String::with_capacity(text.len());
    let mut origin = Vec::with_capacity(text.len());
    let mut pending_space: Option<usize> = None;

    for (offset, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            if let Some(space_at) = pending_space.take() {
                if !out.is_empty() {
                    out.push(' ');
                    origin.push(space_at);
                }
            }
            for lower in ch.to_lowercase() {
                out.push(lower);
                origin.extend(std::iter::repeat(offset).take(lower.len_utf8()));
            }
        } else if pending_space.is_none() {
            pending_space = Some(offset);
        }
    }

    Normalized { text: out, origin }
}

/// Leading `max_chars` characters of a trimmed quote.
fn quote_prefix(quote: &str, max_chars: usize) -> &str {
    let quote = quote.trim();
    match quote.char_indices().nth(max_chars) {
        Some((idx, _)) => &quote[..idx],
        None => quote,
    }
}

/// Byte offset into `chunk.content` where `quote` starts, if it occurs.
pub fn find_quote_offset(quote: &str, content: &str, prefix_chars: usize) -> Option<usize> {
    let needle = normalize(quote_prefix(quote, prefix_chars)).text;
    if needle.is_empty() {
        return None;
    }
    let haystack = normalize(content);
    let at = haystack.text.find(&needle)?;
    haystack.origin.get(at).copied()
}

/// Link of the section whose text starts at or before `offset`.
pub fn link_for_offset(chunk: &InferenceChunk, offset: usize) -> Option<String> {
    chunk
        .source_links
        .range(..=offset)
        .next_back()
        .map(|(_, link)| link.clone())
}

/// Attribute each quote to the first chunk containing it. Quotes found in
/// no chunk are dropped, as are repeats.
pub fn match_quotes_to_docs(
    quotes: &[String],
    chunks: &[InferenceChunk],
    prefix_chars: usize,
) -> Vec<AttributedQuote> {
    let mut attributed: Vec<AttributedQuote> = Vec::new();

    for quote in quotes {
        let quote_text = quote.trim();
        if quote_text.is_empty() || attributed.iter().any(|a| a.quote == quote_text) {
            continue;
        }
        let found = chunks.iter().find_map(|chunk| {
            find_quote_offset(quote_text, &chunk.content, prefix_chars)
                .map(|offset| (chunk, offset))
        });
        if let Some((chunk, offset)) = found {
            attributed.push(AttributedQuote {
                quote: quote_text.to_string(),
                source: QuoteSource {
                    document_id: chunk.document_id.clone(),
                    source_link: link_for_offset(chunk, offset),
                    source_type: chunk.source_type,
                    semantic_identifier: chunk.semantic_identifier.clone(),
                    blurb: chunk.blurb.clone(),
                },
            });
        }
    }

    attributed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchType;
    use std::collections::BTreeMap;

    fn chunk(doc: &str, content: &str, links: &[(usize, &str)]) -> InferenceChunk {
        InferenceChunk {
            document_id: doc.to_string(),
            chunk_id: 0,
            content: content.to_string(),
            blurb: "blurb".to_string(),
            source_links: links.iter().map(|(o, l)| (*o, l.to_string())).collect::<BTreeMap<_, _>>(),
            section_continuation: false,
            source_type: DocumentSource::Web,
            semantic_identifier: doc.to_string(),
            metadata: BTreeMap::new(),
            score: None,
            rerank_score: None,
            search_type: SearchType::Semantic,
        }
    }

    #[test]
    fn test_tolerates_case_and_punctuation() {
        let content = "The Eiffel Tower is in Paris, France.";
        assert_eq!(find_quote_offset("eiffel tower is in paris france", content, 100), Some(4));
        assert_eq!(find_quote_offset("  \"The Eiffel  Tower\" ", content, 100), Some(0));
        assert_eq!(find_quote_offset("London", content, 100), None);
        assert_eq!(find_quote_offset("...", content, 100), None);
    }

    #[test]
    fn test_prefix_truncation() {
        let content = "alpha beta gamma";
        assert_eq!(find_quote_offset("alpha beta and more invented text", content, 10), Some(0));
        assert_eq!(find_quote_offset("alpha beta and more invented text", content, 100), None);
    }

    #[test]
    fn test_link_is_greatest_offset_not_after_match() {
        let content = "Intro text.\n\nSecond section mentions Paris.";
        let second = content.find("Second").unwrap();
        let c = chunk("d1", content, &[(0, "https://a"), (second, "https://b")]);
        let quotes = vec!["mentions Paris".to_string(), "Intro text".to_string()];
        let out = match_quotes_to_docs(&quotes, &[c], 100);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].source.source_link.as_deref(), Some("https://b"));
        assert_eq!(out[1].source.source_link.as_deref(), Some("https://a"));
    }

    #[test]
    fn test_first_matching_chunk_wins_and_unknown_dropped() {
        let chunks = vec![
            chunk("d1", "nothing here", &[(0, "https://1")]),
            chunk("d2", "The tower is tall", &[(0, "https://2")]),
            chunk("d3", "The tower is tall", &[(0, "https://3")]),
        ];
        let quotes = vec![
            "tower is tall".to_string(),
            "tower is tall".to_string(),
            "made up".to_string(),
        ];
        let out = match_quotes_to_docs(&quotes, &chunks, 100);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source.document_id, "d2");
        assert_eq!(out[0].source.blurb, "blurb");
    }

    #[test]
    fn test_multibyte_offsets_map_back() {
        let content = "Café — Ünïcode section";
        let offset = find_quote_offset("ünïcode", content, 100).unwrap();
        assert!(content[offset..].starts_with("Ünïcode"));
    }
}
