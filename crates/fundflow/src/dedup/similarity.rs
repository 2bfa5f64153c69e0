//! Text similarity primitives for the deduplication strategies: normalized
//! token-sort edit-distance for titles and TF-IDF cosine for descriptions.

use std::collections::{HashMap, HashSet};

/// Lowercase, strip punctuation, collapse whitespace.
#[must_use]
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Tokens of the normalized text, sorted, re-joined. Makes the edit
/// distance insensitive to word order ("Series A closes Foo" vs "Foo
/// closes Series A").
#[must_use]
pub fn token_sort(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Classic Levenshtein distance with a rolling row.
#[must_use]
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            curr[j + 1] = substitution.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Edit-distance similarity ratio in [0, 1].
#[must_use]
pub fn ratio(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

/// Token-sort edit-distance ratio over normalized titles.
#[must_use]
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&token_sort(&normalize(a)), &token_sort(&normalize(b)))
}

fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

fn term_frequencies(tokens: &[String]) -> HashMap<&str, f64> {
    let mut tf: HashMap<&str, f64> = HashMap::new();
    for token in tokens {
        *tf.entry(token.as_str()).or_insert(0.0) += 1.0;
    }
    let total = tokens.len().max(1) as f64;
    for value in tf.values_mut() {
        *value /= total;
    }
    tf
}

/// TF-IDF cosine similarity between `a` and `b`, with inverse document
/// frequencies taken over `corpus` plus the two texts themselves.
#[must_use]
pub fn tfidf_cosine(a: &str, b: &str, corpus: &[&str]) -> f64 {
    let tokens_a = tokenize(a);
    let tokens_b = tokenize(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let corpus_tokens: Vec<Vec<String>> = corpus.iter().map(|doc| tokenize(doc)).collect();
    let mut documents: Vec<HashSet<&str>> = Vec::with_capacity(corpus.len() + 2);
    for tokens in &corpus_tokens {
        documents.push(tokens.iter().map(String::as_str).collect());
    }
    documents.push(tokens_a.iter().map(String::as_str).collect());
    documents.push(tokens_b.iter().map(String::as_str).collect());
    let doc_count = documents.len() as f64;

    let idf = |term: &str| -> f64 {
        let containing = documents.iter().filter(|doc| doc.contains(term)).count();
        (doc_count / (1.0 + containing as f64)).ln() + 1.0
    };

    let tf_a = term_frequencies(&tokens_a);
    let tf_b = term_frequencies(&tokens_b);

    let vocabulary: HashSet<&str> = tf_a.keys().chain(tf_b.keys()).copied().collect();
    let mut dot = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;
    for term in vocabulary {
        let weight = idf(term);
        let wa = tf_a.get(term).copied().unwrap_or(0.0) * weight;
        let wb = tf_b.get(term).copied().unwrap_or(0.0) * weight;
        dot += wa * wb;
        norm_a += wa * wa;
        norm_b += wb * wb;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(
            normalize("Foo Ltd. closes $5M Series-A!"),
            "foo ltd closes 5m series a"
        );
    }

    #[test]
    fn test_token_sort_is_order_insensitive() {
        let a = token_sort(&normalize("Series A closes Foo Ltd"));
        let b = token_sort(&normalize("Foo Ltd closes Series A"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("abc", "abc"), 0);
    }

    #[test]
    fn test_ratio_bounds() {
        assert_eq!(ratio("same", "same"), 1.0);
        assert_eq!(ratio("", ""), 1.0);
        assert!(ratio("abcd", "wxyz") < 0.01);
    }

    #[test]
    fn test_token_sort_ratio_detects_reordered_titles() {
        let score = token_sort_ratio(
            "Foo Ltd raises $5M Series A round",
            "Series A round: Foo Ltd raises $5M",
        );
        assert!(score > 0.9, "score was {score}");
    }

    #[test]
    fn test_token_sort_ratio_low_for_unrelated_titles() {
        let score = token_sort_ratio(
            "Foo Ltd raises $5M Series A",
            "Call for proposals: climate resilience grants in Ghana",
        );
        assert!(score < 0.5, "score was {score}");
    }

    #[test]
    fn test_tfidf_cosine_identical_texts() {
        let score = tfidf_cosine(
            "grant program for African AI startups",
            "grant program for African AI startups",
            &[],
        );
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_tfidf_cosine_related_vs_unrelated() {
        let corpus = [
            "funding news from across the continent",
            "weekly digest of technology announcements",
        ];
        let related = tfidf_cosine(
            "Foo Ltd secures five million dollars to expand its AI lending platform",
            "AI lending platform Foo Ltd secures five million dollars for expansion",
            &corpus,
        );
        let unrelated = tfidf_cosine(
            "Foo Ltd secures five million dollars to expand its AI lending platform",
            "University opens robotics laboratory for undergraduate teaching",
            &corpus,
        );
        assert!(related > 0.8, "related was {related}");
        assert!(unrelated < 0.3, "unrelated was {unrelated}");
    }

    #[test]
    fn test_tfidf_cosine_empty_text_is_zero() {
        assert_eq!(tfidf_cosine("", "anything at all", &[]), 0.0);
    }
}
