//! Token estimation and budget allocation.
//!
//! The estimator is a deterministic heuristic, not a real tokenizer: any
//! internally consistent approximation is acceptable as long as it is used
//! uniformly across the engine. Different content types get different
//! character-to-token ratios:
//!
//! - Asian text: ~2 characters per token
//! - Code: ~3 characters per token
//! - English text: ~3.5 characters per token
//!
//! Newlines and special characters add additional weight.

use crate::context::types::{
    TokenBudget, CHARS_PER_TOKEN_ASIAN, CHARS_PER_TOKEN_CODE, CHARS_PER_TOKEN_DEFAULT,
    DEPENDENCY_BUDGET_SHARE, HISTORY_BUDGET_SHARE,
};

/// Token estimator for different content types.
pub struct TokenEstimator;

impl TokenEstimator {
    /// Estimate the number of tokens in a text string.
    ///
    /// Deterministic and monotonic in length for content of a uniform
    /// character class. Returns 0 only for empty input.
    pub fn estimate_tokens(text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let chars_per_token = if Self::has_asian_chars(text) {
            CHARS_PER_TOKEN_ASIAN
        } else if Self::is_code(text) {
            CHARS_PER_TOKEN_CODE
        } else {
            CHARS_PER_TOKEN_DEFAULT
        };

        let char_count = text.chars().count();
        let base_tokens = (char_count as f64 / chars_per_token).ceil() as usize;

        base_tokens + Self::special_weight(text)
    }

    /// Check if text contains a significant share of Asian characters
    /// (Chinese, Japanese, Korean).
    pub fn has_asian_chars(text: &str) -> bool {
        let total_chars = text.chars().count();
        if total_chars == 0 {
            return false;
        }

        let asian_count = text.chars().filter(|c| Self::is_asian_char(*c)).count();
        (asian_count as f64 / total_chars as f64) > 0.2
    }

    fn is_asian_char(c: char) -> bool {
        matches!(c,
            // CJK Unified Ideographs
            '\u{4E00}'..='\u{9FFF}' |
            // CJK Extension A
            '\u{3400}'..='\u{4DBF}' |
            // Hiragana
            '\u{3040}'..='\u{309F}' |
            // Katakana
            '\u{30A0}'..='\u{30FF}' |
            // Hangul Syllables
            '\u{AC00}'..='\u{D7AF}' |
            // Hangul Jamo
            '\u{1100}'..='\u{11FF}'
        )
    }

    /// Heuristic check for code-like content: code punctuation density,
    /// common keywords, or indented code-like lines.
    pub fn is_code(text: &str) -> bool {
        if text.contains("```") || text.contains("~~~") {
            return true;
        }

        let total_chars = text.chars().count();
        if total_chars == 0 {
            return false;
        }

        let code_indicators = [
            '{', '}', '[', ']', '(', ')', ';', '=', '+', '-', '*', '/', '<', '>', '&', '|', '!',
        ];
        let code_char_count = text.chars().filter(|c| code_indicators.contains(c)).count();

        let has_code_patterns = text.contains("fn ")
            || text.contains("impl ")
            || text.contains("struct ")
            || text.contains("enum ")
            || text.contains("use ")
            || text.contains("pub ")
            || text.contains("let ")
            || text.contains("async ")
            || text.contains("return ")
            || text.contains("match ");

        let has_indented_code = text.lines().any(|line| {
            let trimmed = line.trim_start();
            let indent = line.len() - trimmed.len();
            indent >= 2
                && (trimmed.contains('{')
                    || trimmed.contains('}')
                    || trimmed.contains(';')
                    || trimmed.starts_with("let ")
                    || trimmed.starts_with("return ")
                    || trimmed.starts_with("//")
                    || trimmed.starts_with('#'))
        });

        (code_char_count as f64 / total_chars as f64) > 0.05
            || has_code_patterns
            || has_indented_code
    }

    /// Additional weight for newlines and special characters.
    fn special_weight(text: &str) -> usize {
        let newline_count = text.chars().filter(|c| *c == '\n').count();
        let special_count = text
            .chars()
            .filter(|c| {
                matches!(
                    c,
                    '\t' | '\r' | '\\' | '"' | '\'' | '`' | '~' | '@' | '#' | '$' | '%' | '^'
                )
            })
            .count();

        (newline_count as f64 * 0.5).ceil() as usize + (special_count as f64 * 0.25).ceil() as usize
    }
}

// ============================================================================
// Budget Allocation
// ============================================================================

impl TokenBudget {
    /// Allocate a total budget with the default 50/25/25 core/dependencies/
    /// history split. Integer remainder folds into core, so the segments
    /// always sum to the total. `allocate(0)` yields an all-zero budget.
    pub fn allocate(total: usize) -> Self {
        Self::allocate_with_flags(total, true, true)
    }

    /// Allocate a total budget, folding the share of disabled segments into
    /// core so no budget is wasted on segments the request excluded.
    pub fn allocate_with_flags(total: usize, include_deps: bool, include_history: bool) -> Self {
        let dependencies = if include_deps {
            (total as f64 * DEPENDENCY_BUDGET_SHARE) as usize
        } else {
            0
        };
        let history = if include_history {
            (total as f64 * HISTORY_BUDGET_SHARE) as usize
        } else {
            0
        };
        let core = total - dependencies - history;

        Self {
            total,
            core,
            dependencies,
            history,
        }
    }

    /// Whether the segment sums match the total (always true for budgets
    /// built through the allocators).
    pub fn is_consistent(&self) -> bool {
        self.core + self.dependencies + self.history == self.total
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(TokenEstimator::estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_english() {
        let tokens = TokenEstimator::estimate_tokens("Hello, world! This is a test.");
        assert!(tokens > 0);
        assert!(tokens < 20);
    }

    #[test]
    fn test_estimate_tokens_chinese() {
        let tokens = TokenEstimator::estimate_tokens("你好世界，这是一个测试。");
        assert!(tokens > 0);
        assert!(tokens < 15);
    }

    #[test]
    fn test_estimate_tokens_code() {
        let code = "fn main() {\n    println!(\"hi\");\n}\n";
        assert!(TokenEstimator::is_code(code));
        assert!(TokenEstimator::estimate_tokens(code) > 0);
    }

    #[test]
    fn test_has_asian_chars() {
        assert!(TokenEstimator::has_asian_chars("你好世界"));
        assert!(TokenEstimator::has_asian_chars("こんにちは"));
        assert!(TokenEstimator::has_asian_chars("안녕하세요"));
        assert!(!TokenEstimator::has_asian_chars("Hello, world!"));
        assert!(!TokenEstimator::has_asian_chars(""));
    }

    #[test]
    fn test_is_code_plain_text() {
        assert!(!TokenEstimator::is_code(
            "This is just plain English text without any syntax"
        ));
    }

    #[test]
    fn test_estimate_is_deterministic() {
        let text = "let value = compute(input);";
        assert_eq!(
            TokenEstimator::estimate_tokens(text),
            TokenEstimator::estimate_tokens(text)
        );
    }

    #[test]
    fn test_allocate_default_split() {
        let budget = TokenBudget::allocate(1000);
        assert_eq!(budget.total, 1000);
        assert_eq!(budget.dependencies, 250);
        assert_eq!(budget.history, 250);
        assert_eq!(budget.core, 500);
        assert!(budget.is_consistent());
    }

    #[test]
    fn test_allocate_remainder_folds_into_core() {
        // 1001 * 0.25 = 250 (truncated) twice, so core absorbs 501
        let budget = TokenBudget::allocate(1001);
        assert_eq!(budget.dependencies, 250);
        assert_eq!(budget.history, 250);
        assert_eq!(budget.core, 501);
        assert!(budget.is_consistent());
    }

    #[test]
    fn test_allocate_zero() {
        let budget = TokenBudget::allocate(0);
        assert_eq!(budget.total, 0);
        assert_eq!(budget.core, 0);
        assert_eq!(budget.dependencies, 0);
        assert_eq!(budget.history, 0);
        assert!(budget.is_consistent());
    }

    #[test]
    fn test_allocate_with_disabled_segments() {
        let budget = TokenBudget::allocate_with_flags(1000, false, false);
        assert_eq!(budget.core, 1000);
        assert_eq!(budget.dependencies, 0);
        assert_eq!(budget.history, 0);
        assert!(budget.is_consistent());

        let budget = TokenBudget::allocate_with_flags(1000, true, false);
        assert_eq!(budget.dependencies, 250);
        assert_eq!(budget.history, 0);
        assert_eq!(budget.core, 750);
        assert!(budget.is_consistent());
    }
}
