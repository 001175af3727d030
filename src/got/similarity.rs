//! Deterministic word-overlap similarity.

use std::collections::BTreeSet;

/// Case-folded alphanumeric tokens of at least four characters.
pub fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 4)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Jaccard similarity of two token sets. Two empty sets are identical.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Jaccard similarity of the token sets of two texts.
pub fn similarity(a: &str, b: &str) -> f64 {
    jaccard(&tokens(a), &tokens(b))
}

/// `1 - mean similarity` of `query` against `others`; 1.0 with nothing to compare.
pub fn diversity(query: &str, others: &[&str]) -> f64 {
    if others.is_empty() {
        return 1.0;
    }
    let own = tokens(query);
    let total: f64 = others.iter().map(|o| jaccard(&own, &tokens(o))).sum();
    (1.0 - total / others.len() as f64).clamp(0.0, 1.0)
}
