//! Message tokenization for the inverted index.

/// Split text into lowercase alphanumeric tokens. Everything else is a
/// separator. The same function runs at index and query time so terms line
/// up exactly.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokenize lazily, for callers that stream into a set or probe for a
/// match without materializing the whole token list.
pub fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}
