//! Tokenization for the search family.
//!
//! Indexed text is lowercased and split on non-alphanumeric boundaries;
//! each surviving token is expanded into its substrings so that `search`
//! can match any infix. Token ordinals count every token of the original
//! text (including stopwords), so phrase queries can test adjacency
//! against the ordinals stored in [`crate::model::Position`]s.

/// A lowercase token and its ordinal within the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAt {
    /// The lowercase token.
    pub token: String,

    /// The token's ordinal among all tokens of the source text.
    pub index: u32,
}

/// Splits `text` into lowercase tokens with ordinals, dropping
/// stopwords but preserving the ordinals of the survivors.
pub fn tokenize(text: &str, stopwords: &[String]) -> Vec<TokenAt> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .enumerate()
        .filter_map(|(i, raw)| {
            let token = raw.to_lowercase();
            if stopwords.iter().any(|s| s == &token) {
                None
            } else {
                Some(TokenAt {
                    token,
                    index: i as u32,
                })
            }
        })
        .collect()
}

/// Every non-empty substring of `token`, by character boundaries.
///
/// This is the infix expansion the search family indexes under; it is
/// quadratic in token length, which the indexed corpus amortises by
/// containing natural-language words.
pub fn substrings(token: &str) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    let mut out = Vec::new();
    for start in 0..chars.len() {
        for end in (start + 1)..=chars.len() {
            out.push(chars[start..end].iter().collect());
        }
    }
    out.sort_unstable();
    out.dedup();
    out
}

/// Whether the tokens of `value` contain the query tokens as a phrase:
/// each query token appears in the same record-relative position run,
/// i.e. at ordinals `p, p+d₁, p+d₂, …` matching the query's own
/// ordinal deltas.
///
/// Query tokens match by **infix**: a stored token matches a query
/// token when it contains it, mirroring the substring expansion of the
/// index.
pub fn phrase_matches(value_tokens: &[TokenAt], query_tokens: &[TokenAt]) -> bool {
    let Some(first) = query_tokens.first() else {
        return false;
    };
    value_tokens
        .iter()
        .filter(|vt| vt.token.contains(&first.token))
        .any(|anchor| {
            query_tokens.iter().all(|qt| {
                let delta = qt.index - first.index;
                let wanted = anchor.index + delta;
                value_tokens
                    .iter()
                    .any(|vt| vt.index == wanted && vt.token.contains(&qt.token))
            })
        })
}
