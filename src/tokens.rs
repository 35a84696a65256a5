use std::sync::OnceLock;
use tiktoken_rs::{CoreBPE, o200k_base};

static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn bpe() -> Option<&'static CoreBPE> {
    BPE.get_or_init(|| match o200k_base() {
        Ok(bpe) => Some(bpe),
        Err(err) => {
            tracing::warn!("tokenizer unavailable, using character estimate: {err}");
            None
        }
    })
    .as_ref()
}

/// Approximate token count. Not billing-accurate: upstream models use their
/// own tokenizers.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match bpe() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => (text.chars().count() as u64).div_ceil(4),
    }
}

#[cfg(test)]
mod tests {
    use super::estimate_tokens;

    #[test]
    fn empty_text_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimate_grows_with_text() {
        let short = estimate_tokens("Hello");
        let long = estimate_tokens("Hello world, this is a longer sentence.");
        assert!(short >= 1);
        assert!(long > short);
    }
}
