//! Token-count heuristic for prompt budgets.
//!
//! Uses the rough 4 characters ≈ 1 token ratio. Budgets built on it are
//! conservative enough for the chat models Mimic targets.

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count of `text`, rounded up.
pub fn count_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("abc"), 1);
        assert_eq!(count_tokens("abcd"), 1);
        assert_eq!(count_tokens("abcde"), 2);
    }
}
