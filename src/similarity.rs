//! Field-level similarity scoring for extracted values
//!
//! Compares an expected value against what the extraction pipeline produced
//! and reports a normalized similarity in `[0, 1]` together with a list of
//! human-readable issues.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

/// Similarity returned when two strings differ only in case, punctuation or spacing
pub const NORMALIZED_MATCH_SIMILARITY: f64 = 0.95;

/// Strictly above this similarity a field counts as matched
pub const MATCH_THRESHOLD: f64 = 0.85;

/// Below this similarity a string field is flagged as a low-similarity extraction
const LOW_SIMILARITY_THRESHOLD: f64 = 0.5;

/// Coarse value kind used for type comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Structured,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) | Value::Object(_) => ValueKind::Structured,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Structured => "object",
        }
    }
}

/// Compute the similarity between an expected and an actual value.
///
/// Never fails: values that cannot be compared score 0.
pub fn similarity(expected: &Value, actual: &Value) -> f64 {
    match (expected, actual) {
        (Value::String(e), Value::String(a)) => string_similarity(e, a),
        (Value::Number(e), Value::Number(a)) => match (e.as_f64(), a.as_f64()) {
            (Some(e), Some(a)) => number_similarity(e, a),
            _ => 0.0,
        },
        (Value::Bool(e), Value::Bool(a)) => {
            if e == a {
                1.0
            } else {
                0.0
            }
        }
        (Value::Null, Value::Null) => 1.0,
        _ if ValueKind::of(expected) == ValueKind::Structured
            && ValueKind::of(actual) == ValueKind::Structured =>
        {
            match (serde_json::to_string(expected), serde_json::to_string(actual)) {
                (Ok(e), Ok(a)) => string_similarity(&e, &a),
                _ => 0.0,
            }
        }
        _ => 0.0,
    }
}

/// String similarity: exact → 1, equal after normalization → 0.95,
/// otherwise Levenshtein ratio over the normalized forms.
pub fn string_similarity(expected: &str, actual: &str) -> f64 {
    if expected == actual {
        return 1.0;
    }

    let e = normalize(expected);
    let a = normalize(actual);
    if e == a {
        return NORMALIZED_MATCH_SIMILARITY;
    }

    let e_len = e.chars().count();
    let a_len = a.chars().count();
    let max_len = e_len.max(a_len);
    if max_len == 0 {
        return 1.0;
    }

    let distance = levenshtein(&e, &a);
    (1.0 - distance as f64 / max_len as f64).max(0.0)
}

/// Relative-difference similarity for numbers.
pub fn number_similarity(expected: f64, actual: f64) -> f64 {
    if expected == actual {
        return 1.0;
    }
    let scale = expected.abs().max(actual.abs());
    if scale == 0.0 || !scale.is_finite() {
        return 0.0;
    }
    (1.0 - (expected - actual).abs() / scale).max(0.0)
}

/// Lowercase, drop punctuation, collapse whitespace.
pub fn normalize(text: &str) -> String {
    let cleaned: String = text
        .nfc()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Levenshtein edit distance over characters.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    // Two rolling rows are enough
    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for i in 1..=a_len {
        curr_row[0] = i;
        for j in 1..=b_len {
            let cost = usize::from(a_chars[i - 1] != b_chars[j - 1]);
            curr_row[j] = (prev_row[j] + 1)
                .min(curr_row[j - 1] + 1)
                .min(prev_row[j - 1] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

fn digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").expect("valid digit regex"))
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\d{1,2}[-/]\d{1,2}[-/]\d{2,4}|\d{4}-\d{2}-\d{2}").expect("valid date regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid email regex")
    })
}

/// List the issues found when comparing one field.
///
/// The result is deterministic for a given input. A type mismatch is reported
/// on its own; the string and number heuristics only run when both sides share
/// a kind.
pub fn identify_issues(field: &str, expected: &Value, actual: &Value, similarity: f64) -> Vec<String> {
    let mut issues = Vec::new();

    let expected_kind = ValueKind::of(expected);
    let actual_kind = ValueKind::of(actual);
    if expected_kind != actual_kind {
        issues.push(format!(
            "Type mismatch: expected {}, got {}",
            expected_kind.name(),
            actual_kind.name()
        ));
        return issues;
    }

    let field_lower = field.to_lowercase();

    match (expected, actual) {
        (Value::String(e), Value::String(a)) => {
            if similarity < LOW_SIMILARITY_THRESHOLD {
                issues.push("Low similarity".to_string());
            }

            let e_trimmed = e.trim();
            let a_trimmed = a.trim();
            if !e_trimmed.is_empty() && a_trimmed.is_empty() {
                issues.push("Missing extraction: expected value not found".to_string());
            }
            if e_trimmed.is_empty() && !a_trimmed.is_empty() {
                issues.push("Unexpected extraction: value found where none expected".to_string());
            }

            let e_len = e.chars().count();
            let a_len = a.chars().count();
            if e_len.abs_diff(a_len) as f64 > 0.5 * e_len as f64 {
                issues.push("Significant length difference".to_string());
            }

            if (field_lower.contains("amount") || field_lower.contains("value"))
                && digits_re().is_match(e)
                && !digits_re().is_match(a)
            {
                issues.push("Numeric value not properly extracted".to_string());
            }

            if field_lower.contains("date") && date_re().is_match(e) && !date_re().is_match(a) {
                issues.push("Date format not recognized or incorrectly extracted".to_string());
            }

            if field_lower.contains("email") && email_re().is_match(e) && !email_re().is_match(a) {
                issues.push("Email address not properly extracted".to_string());
            }
        }
        (Value::Number(e), Value::Number(a)) => {
            if let (Some(e), Some(a)) = (e.as_f64(), a.as_f64()) {
                let diff = (e - a).abs();
                if diff > (0.1 * e.abs()).max(1.0) {
                    issues.push(format!("Numeric value differs by {:.2}", diff));
                }
            }
        }
        _ => {}
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_strings_score_one() {
        for s in ["", "abc", "John Smith", "  spaced  out ", "ümlaut"] {
            assert_eq!(similarity(&json!(s), &json!(s)), 1.0, "failed for {:?}", s);
        }
    }

    #[test]
    fn test_normalized_equal_strings() {
        assert_eq!(similarity(&json!("John Smith"), &json!("john  smith.")), 0.95);
        assert_eq!(similarity(&json!("ACME, Ltd"), &json!("acme ltd")), 0.95);
    }

    #[test]
    fn test_empty_string_edges() {
        assert_eq!(similarity(&json!(""), &json!("")), 1.0);
        assert_eq!(similarity(&json!("abc"), &json!("")), 0.0);
        assert_eq!(similarity(&json!(""), &json!("abc")), 0.0);
    }

    #[test]
    fn test_levenshtein_ratio() {
        let s = similarity(&json!("John Smith"), &json!("Jon Smith"));
        assert!((s - 0.9).abs() < 1e-9, "got {}", s);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
    }

    #[test]
    fn test_number_similarity() {
        assert_eq!(similarity(&json!(0), &json!(0)), 1.0);
        assert_eq!(similarity(&json!(42.5), &json!(42.5)), 1.0);
        let s = similarity(&json!(250000), &json!(250100));
        assert!((s - (1.0 - 100.0 / 250100.0)).abs() < 1e-12);
        assert_eq!(similarity(&json!(10), &json!(-10)), 0.0);
        assert_eq!(similarity(&json!(0), &json!(5)), 0.0);
    }

    #[test]
    fn test_type_mismatch_scores_zero() {
        assert_eq!(similarity(&json!("250000"), &json!(250000)), 0.0);
        assert_eq!(similarity(&json!(true), &json!("true")), 0.0);
        assert_eq!(similarity(&json!(null), &json!("x")), 0.0);
    }

    #[test]
    fn test_booleans_and_structures() {
        assert_eq!(similarity(&json!(true), &json!(true)), 1.0);
        assert_eq!(similarity(&json!(true), &json!(false)), 0.0);
        assert_eq!(similarity(&json!({"a": 1}), &json!({"a": 1})), 1.0);
        assert_eq!(similarity(&json!([1, 2]), &json!([1, 2])), 1.0);
        let s = similarity(&json!({"a": 1}), &json!({"a": 2}));
        assert!(s > 0.0 && s < 1.0);
    }

    #[test]
    fn test_type_mismatch_issue_only() {
        let issues = identify_issues("loanAmount", &json!(100), &json!("100"), 0.0);
        assert_eq!(issues, vec!["Type mismatch: expected number, got string".to_string()]);
    }

    #[test]
    fn test_missing_extraction_issues() {
        let issues = identify_issues("applicantName", &json!("John Smith"), &json!(""), 0.0);
        assert!(issues.contains(&"Low similarity".to_string()));
        assert!(issues.iter().any(|i| i.starts_with("Missing extraction")));
        assert!(issues.contains(&"Significant length difference".to_string()));

        let issues = identify_issues("notes", &json!(""), &json!("something"), 0.0);
        assert!(issues.iter().any(|i| i.starts_with("Unexpected extraction")));
    }

    #[test]
    fn test_field_name_heuristics() {
        let issues = identify_issues("propertyValue", &json!("$450,000"), &json!("four hundred"), 0.2);
        assert!(issues.contains(&"Numeric value not properly extracted".to_string()));

        let issues = identify_issues("settlementDate", &json!("15/03/2024"), &json!("March"), 0.1);
        assert!(issues.contains(&"Date format not recognized or incorrectly extracted".to_string()));

        let issues = identify_issues("settlementDate", &json!("2024-03-15"), &json!("15/03/2024"), 0.3);
        assert!(!issues.iter().any(|i| i.starts_with("Date format")));

        let issues = identify_issues("brokerEmail", &json!("a.b@example.com"), &json!("a.b example"), 0.6);
        assert!(issues.contains(&"Email address not properly extracted".to_string()));
    }

    #[test]
    fn test_numeric_difference_issue() {
        let issues = identify_issues("loanAmount", &json!(250000), &json!(200000), 0.8);
        assert_eq!(issues, vec!["Numeric value differs by 50000.00".to_string()]);

        // Within 10% tolerance
        let issues = identify_issues("loanAmount", &json!(250000), &json!(250100), 0.9996);
        assert!(issues.is_empty());

        // Small values use the absolute floor of 1
        let issues = identify_issues("term", &json!(3), &json!(3.5), 0.86);
        assert!(issues.is_empty());
    }
}
