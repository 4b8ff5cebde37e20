//! Incremental extraction of the `"answer"` string from a streamed JSON
//! reply.
//!
//! Tokens are appended to a buffer. Until the prefix `"answer"`, `:`, `"`
//! (whitespace allowed between them) has been seen nothing is emitted.
//! From then on the string body is decoded as JSON: `\"`, `\\`, `\/`,
//! `\b`, `\f`, `\n`, `\r`, `\t` and `\uXXXX` (with surrogate pairs) are
//! unescaped. An escape split across tokens is held back until complete.
//! The first unescaped `"` ends the answer; later tokens are only buffered
//! for the final parse.

use std::sync::OnceLock;

use regex::Regex;

fn answer_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""answer"\s*:\s*""#).expect("valid regex"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Seeking,
    InAnswer,
    Done,
}

#[derive(Debug)]
pub struct AnswerStreamExtractor {
    raw: String,
    cursor: usize,
    phase: Phase,
    emitted_any: bool,
}

impl Default for AnswerStreamExtractor {
    fn default() -> Self {
        Self::new()
    }
}

enum Step {
    /// Decoded text and bytes consumed.
    Text(String, usize),
    /// Closing quote; bytes consumed.
    End(usize),
    /// Escape incomplete; wait for more input.
    NeedMore,
}

impl AnswerStreamExtractor {
    pub fn new() -> Self {
        Self {
            raw: String::new(),
            cursor: 0,
            phase: Phase::Seeking,
            emitted_any: false,
        }
    }

    /// Everything received so far.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn into_raw(self) -> String {
        self.raw
    }

    /// The closing quote of the answer has been seen.
    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn emitted_any(&self) -> bool {
        self.emitted_any
    }

    /// Feed one token. Returns newly decoded answer text, if any.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.raw.push_str(token);

        if self.phase == Phase::Seeking {
            let found = answer_prefix().find(&self.raw[self.cursor..]);
            match found {
                Some(m) => {
                    self.cursor += m.end();
                    self.phase = Phase::InAnswer;
                }
                None => return None,
            }
        }
        if self.phase != Phase::InAnswer {
            return None;
        }

        let mut out = String::new();
        loop {
            match decode_step(&self.raw[self.cursor..]) {
                Some(Step::Text(text, used)) => {
                    out.push_str(&text);
                    self.cursor += used;
                }
                Some(Step::End(used)) => {
                    self.cursor += used;
                    self.phase = Phase::Done;
                    break;
                }
                Some(Step::NeedMore) | None => break,
            }
        }

        if out.is_empty() {
            None
        } else {
            self.emitted_any = true;
            Some(out)
        }
    }
}

/// Decode the next unit of a JSON string body. `None` at end of input.
fn decode_step(input: &str) -> Option<Step> {
    let mut chars = input.chars();
    let c = chars.next()?;
    match c {
        '"' => Some(Step::End(1)),
        '\\' => {
            let esc = match chars.next() {
                Some(e) => e,
                None => return Some(Step::NeedMore),
            };
            let simple = match esc {
                '"' => Some('"'),
                '\\' => Some('\\'),
                '/' => Some('/'),
                'b' => Some('\u{8}'),
                'f' => Some('\u{c}'),
                'n' => Some('\n'),
                'r' => Some('\r'),
                't' => Some('\t'),
                'u' => None,
                other => return Some(Step::Text(other.to_string(), 1 + other.len_utf8())),
            };
            match simple {
                Some(ch) => Some(Step::Text(ch.to_string(), 2)),
                None => decode_unicode_escape(input),
            }
        }
        other => Some(Step::Text(other.to_string(), other.len_utf8())),
    }
}

/// `input` starts with `\u`.
fn decode_unicode_escape(input: &str) -> Option<Step> {
    let Some(hex) = input.get(2..6) else {
        return if input.len() < 6 {
            Some(Step::NeedMore)
        } else {
            Some(Step::Text("\\u".to_string(), 2))
        };
    };
    let Ok(unit) = u16::from_str_radix(hex, 16) else {
        // Malformed escape: pass it through literally.
        return Some(Step::Text("\\u".to_string(), 2));
    };

    if (0xD800..0xDC00).contains(&unit) {
        let rest = &input[6..];
        if rest.is_empty() || rest == "\\" {
            return Some(Step::NeedMore);
        }
        if rest.starts_with("\\u") {
            match rest.get(2..6) {
                None if rest.len() < 6 => return Some(Step::NeedMore),
                Some(low_hex) => {
                    if let Ok(low) = u16::from_str_radix(low_hex, 16) {
                        if (0xDC00..0xE000).contains(&low) {
                            let decoded = char::decode_utf16([unit, low])
                                .next()
                                .and_then(|r| r.ok())
                                .unwrap_or('\u{FFFD}');
                            return Some(Step::Text(decoded.to_string(), 12));
                        }
                    }
                }
                None => {}
            }
        }
        return Some(Step::Text('\u{FFFD}'.to_string(), 6));
    }

    let decoded = char::from_u32(unit as u32).unwrap_or('\u{FFFD}');
    Some(Step::Text(decoded.to_string(), 6))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(tokens: &[&str]) -> (String, AnswerStreamExtractor) {
        let mut ex = AnswerStreamExtractor::new();
        let mut out = String::new();
        for t in tokens {
            if let Some(piece) = ex.push(t) {
                out.push_str(&piece);
            }
        }
        (out, ex)
    }

    #[test]
    fn test_emits_answer_across_tokens() {
        let (out, ex) = run(&["{\"ans", "wer\": \"The tower", " is in Paris", ".\", \"quotes\": []}"]);
        assert_eq!(out, "The tower is in Paris.");
        assert!(ex.is_done());
        assert!(ex.raw().ends_with("[]}"));
    }

    #[test]
    fn test_whitespace_around_colon() {
        let (out, _) = run(&["{ \"answer\" :\n \"ok\"}"]);
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_escapes_split_across_tokens() {
        let (out, ex) = run(&["{\"answer\": \"say \\", "\"hi\\", "\" then\\nbye\\u00", "e9\"}"]);
        assert_eq!(out, "say \"hi\" then\nbyeé");
        assert!(ex.is_done());
    }

    #[test]
    fn test_surrogate_pair() {
        let (out, _) = run(&["{\"answer\": \"\\ud83d", "\\ude00\"}"]);
        assert_eq!(out, "😀");
    }

    #[test]
    fn test_nothing_emitted_without_answer_field() {
        let (out, ex) = run(&["Answer: Paris", "\nQuote: x"]);
        assert!(out.is_empty());
        assert!(!ex.emitted_any());
        assert!(!ex.is_done());
    }

    #[test]
    fn test_stops_at_closing_quote() {
        let (out, _) = run(&["{\"answer\": \"a\", \"quotes\": [\"not answer\"]}"]);
        assert_eq!(out, "a");
    }
}
