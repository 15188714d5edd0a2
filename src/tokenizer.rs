//! Token counting with the embedding model's byte-pair encoding.
//!
//! Chunk-size validation must agree exactly with what the embedding
//! service sees, so counts come from the `cl100k_base` BPE rather than a
//! chars-per-token estimate. The encoder is built once per process and
//! read-only afterwards.

use std::sync::OnceLock;
use tiktoken_rs::{cl100k_base, CoreBPE};

static ENCODING: OnceLock<CoreBPE> = OnceLock::new();

fn encoding() -> &'static CoreBPE {
    ENCODING.get_or_init(|| cl100k_base().expect("embedded cl100k_base ranks always parse"))
}

/// Count BPE tokens in `text`. Empty text is zero tokens.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    encoding().encode_ordinary(text).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn counts_are_positive_and_deterministic() {
        let text = "No person shall operate a food establishment without a permit.";
        let a = count_tokens(text);
        let b = count_tokens(text);
        assert!(a > 0);
        assert_eq!(a, b);
    }

    #[test]
    fn longer_text_has_more_tokens() {
        let short = "Section 117.3 Definitions.";
        let long = short.repeat(50);
        assert!(count_tokens(&long) > count_tokens(short));
    }
}
