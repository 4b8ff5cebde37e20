//! Tolerant parsing of model answers.
//!
//! JSON first (the object may be wrapped in prose or a code fence), then a
//! free-form `Answer: ... Quote: ...` layout. Anything else parses to
//! nothing; parsing never fails.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Answer text and quotes as the model gave them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedAnswer {
    pub answer: Option<String>,
    pub quotes: Option<Vec<String>>,
}

pub fn parse_answer(raw: &str) -> ParsedAnswer {
    parse_json_answer(raw)
        .or_else(|| parse_freeform_answer(raw))
        .unwrap_or_default()
}

/// Outermost `{...}` span of `raw`, if any.
pub(crate) fn json_object_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn parse_json_answer(raw: &str) -> Option<ParsedAnswer> {
    let value: Value = serde_json::from_str(json_object_span(raw)?).ok()?;
    let obj = value.as_object()?;
    if !obj.contains_key("answer") {
        return None;
    }
    let answer = obj
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string);
    let quotes = obj.get("quotes").and_then(Value::as_array).map(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect::<Vec<_>>()
    });
    Some(ParsedAnswer { answer, quotes })
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(answer|quotes?)\s*:").expect("valid regex"))
}

fn parse_freeform_answer(raw: &str) -> Option<ParsedAnswer> {
    let markers: Vec<(bool, usize, usize)> = marker_regex()
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let is_answer = caps.get(1)?.as_str().eq_ignore_ascii_case("answer");
            Some((is_answer, whole.start(), whole.end()))
        })
        .collect();

    let first_answer = markers.iter().position(|(is_answer, _, _)| *is_answer)?;

    let mut answer = None;
    let mut quotes = Vec::new();
    for (i, (is_answer, _, body_start)) in markers.iter().enumerate().skip(first_answer) {
        let body_end = markers.get(i + 1).map(|m| m.1).unwrap_or(raw.len());
        let body = clean_block(&raw[*body_start..body_end]);
        if body.is_empty() {
            continue;
        }
        if *is_answer && answer.is_none() {
            answer = Some(body);
        } else if !*is_answer {
            quotes.push(body);
        }
    }

    if answer.is_none() {
        return None;
    }
    Some(ParsedAnswer {
        answer,
        quotes: Some(quotes),
    })
}

fn clean_block(block: &str) -> String {
    block
        .trim()
        .trim_start_matches(['-', '*'])
        .trim()
        .trim_matches('"')
        .trim()
        .to_string()
}
