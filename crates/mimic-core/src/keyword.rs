//! Query preprocessing for the keyword index.
//!
//! Questions are tokenized on non-alphanumerics, lowercased, and stripped of
//! English stopwords before they reach a [`crate::index::KeywordIndex`].
//! Stemming and ranking belong to the index (the SQLite store uses an FTS5
//! table with the porter tokenizer and `bm25`). [`is_typo_of`] decides
//! whether an indexed term is close enough to a query term to be searched
//! in its place.

use std::collections::HashSet;

/// Weight of semantic-identifier matches relative to content matches.
pub const IDENTIFIER_WEIGHT: f64 = 3.0;
/// Maximum edit distance accepted as a typo.
pub const MAX_TYPOS: usize = 2;

const ONE_TYPO_MIN_LEN: usize = 4;
const TWO_TYPO_MIN_LEN: usize = 7;

const STOPWORDS: &[&str] = &[
    "a", "about", "above", "after", "again", "against", "all", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
    "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "herself",
    "him", "himself", "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just",
    "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of", "off", "on", "once",
    "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own", "same", "she",
    "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them",
    "themselves", "then", "there", "these", "they", "this", "those", "through", "to", "too",
    "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.contains(&token)
}

/// Split on anything that is not alphanumeric and lowercase.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokenize and drop stopwords.
pub fn analyze(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stopword(t))
        .collect()
}

/// Turn a user question into the space-separated term string handed to the
/// keyword index. Duplicates are dropped; a query made only of stopwords
/// falls back to its raw tokens.
pub fn preprocess_query(query: &str) -> String {
    let mut terms = analyze(query);
    if terms.is_empty() {
        terms = tokenize(query);
    }
    let mut seen = HashSet::new();
    terms.retain(|t| seen.insert(t.clone()));
    terms.join(" ")
}

/// Typo budget for a query term of this length.
pub fn typo_budget(term: &str) -> usize {
    let len = term.chars().count();
    if len >= TWO_TYPO_MIN_LEN {
        MAX_TYPOS
    } else if len >= ONE_TYPO_MIN_LEN {
        1
    } else {
        0
    }
}

/// `candidate` differs from `term` by at least one and at most
/// [`typo_budget`] edits.
pub fn is_typo_of(term: &str, candidate: &str) -> bool {
    let budget = typo_budget(term);
    budget > 0 && matches!(bounded_levenshtein(term, candidate, budget), Some(d) if d > 0)
}

/// Edit distance between `a` and `b`, or `None` once it exceeds `max`.
pub fn bounded_levenshtein(a: &str, b: &str, max: usize) -> Option<usize> {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.len().abs_diff(b.len()) > max {
        return None;
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        curr[0] = i;
        let mut row_min = curr[0];
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            row_min = row_min.min(curr[j]);
        }
        if row_min > max {
            return None;
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    let d = prev[b.len()];
    (d <= max).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyze_removes_stopwords() {
        assert_eq!(analyze("Where is the Eiffel Tower?"), vec!["eiffel", "tower"]);
        assert_eq!(analyze("what is it"), Vec::<String>::new());
    }

    #[test]
    fn test_preprocess_query_fallback_for_stopwords_only() {
        assert_eq!(preprocess_query("what is it"), "what is it");
        assert_eq!(preprocess_query("The Who"), "the who");
        assert_eq!(preprocess_query("tower Tower TOWER"), "tower");
    }

    #[test]
    fn test_bounded_levenshtein() {
        assert_eq!(bounded_levenshtein("tower", "tower", 2), Some(0));
        assert_eq!(bounded_levenshtein("tower", "towr", 2), Some(1));
        assert_eq!(bounded_levenshtein("kitten", "sitting", 2), None);
        assert_eq!(bounded_levenshtein("kitten", "sitting", 3), Some(3));
    }

    #[test]
    fn test_typo_budget_by_length() {
        assert!(is_typo_of("eifel", "eiffel"));
        assert!(is_typo_of("restaruant", "restaurant"));
        assert!(!is_typo_of("cat", "cot"));
        assert!(!is_typo_of("tower", "tower"));
        assert!(!is_typo_of("tower", "power plant"));
    }
}
