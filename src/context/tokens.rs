//! Token estimation.
//!
//! A word is any maximal run of non-whitespace; the estimate is
//! `ceil(words * 1.3)`.

const TOKENS_PER_WORD: f64 = 1.3;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn estimate_tokens(text: &str) -> usize {
    (word_count(text) as f64 * TOKENS_PER_WORD).ceil() as usize
}

/// Drop whole words from the tail until the text fits `budget`.
pub fn truncate_to_budget(text: &str, budget: usize) -> String {
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }
    let max_words = (budget as f64 / TOKENS_PER_WORD).floor() as usize;
    text.split_whitespace()
        .take(max_words)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 2); // ceil(1.3)
        assert_eq!(estimate_tokens("one two three"), 4); // ceil(3.9)
        assert_eq!(estimate_tokens("a  b\n\tc   d"), 6); // ceil(5.2)
    }

    #[test]
    fn truncate_keeps_text_that_already_fits() {
        assert_eq!(truncate_to_budget("short text", 10), "short text");
    }

    #[test]
    fn truncate_drops_words_from_the_tail() {
        let text = "alpha beta gamma delta epsilon";
        let truncated = truncate_to_budget(text, 4);
        assert_eq!(truncated, "alpha beta gamma");
        assert!(estimate_tokens(&truncated) <= 4);
    }

    #[test]
    fn zero_budget_yields_empty_text() {
        assert_eq!(truncate_to_budget("anything at all", 0), "");
    }
}
