//! Post-processing of raw LLM completions.
//!
//! Providers wrap SQL in fences, prefix it with labels, or append prose
//! no matter how firmly the prompt forbids it. These passes run in a
//! fixed order: strip to SQL, detect the clarification marker, extract
//! the confidence line, then truncate to a single statement.

use std::sync::LazyLock;

use regex::Regex;

use super::prompt::ERROR_MARKER;

static SQL_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(SELECT|WITH|INSERT|UPDATE|DELETE|--)\b").expect("static regex")
});
static CONFIDENCE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*--\s*CONFIDENCE:\s*(\d{1,3})\s*%?\s*$").expect("static regex")
});

/// Strip fences, labels, and surrounding prose; keep from the first
/// SQL-looking line.
#[must_use]
pub fn strip_to_sql(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    // Fenced block wins if present.
    if let Some(open) = text.find("```") {
        let after = &text[open + 3..];
        let after = after
            .strip_prefix("sql")
            .or_else(|| after.strip_prefix("SQL"))
            .unwrap_or(after);
        let inner = match after.find("```") {
            Some(close) => &after[..close],
            None => after,
        };
        text = inner.trim().to_string();
    }

    // Leading "SQL:" label.
    if let Some(rest) = text.strip_prefix("SQL:").or_else(|| text.strip_prefix("sql:")) {
        text = rest.trim_start().to_string();
    }

    // Drop any prose before the first SQL-looking line.
    if let Some(m) = SQL_START.find(&text) {
        text = text[m.start()..].trim().to_string();
    }

    text
}

/// Detect the clarification marker; returns the message when present.
#[must_use]
pub fn extract_clarification(sql: &str) -> Option<String> {
    let trimmed = sql.trim_start();
    if !trimmed.starts_with(ERROR_MARKER) {
        return None;
    }
    let message: Vec<&str> = trimmed
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix(ERROR_MARKER)
                .or_else(|| line.strip_prefix("--"))
                .map(str::trim)
        })
        .filter(|l| !l.is_empty())
        .collect();
    Some(message.join(" "))
}

/// Extract and strip the `-- CONFIDENCE: N%` line.
///
/// Returns the SQL without the marker and the parsed confidence, clamped
/// to 100.
#[must_use]
pub fn extract_confidence(sql: &str) -> (String, Option<u8>) {
    let mut confidence = None;
    if let Some(caps) = CONFIDENCE_LINE.captures(sql) {
        confidence = caps[1].parse::<u16>().ok().map(|n| n.min(100) as u8);
    }
    let without = CONFIDENCE_LINE.replace_all(sql, "");
    (without.trim().to_string(), confidence)
}

/// Keep only the first statement.
///
/// Splits on `;` outside of quotes and comments; a discarded remainder
/// comes back as a warning string.
#[must_use]
pub fn first_statement(sql: &str) -> (String, Option<String>) {
    let mut in_single = false;
    let mut in_double = false;
    let mut in_line_comment = false;
    let mut split_at = None;
    let bytes: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if in_line_comment {
            if c == '\n' {
                in_line_comment = false;
            }
        } else if in_single {
            if c == '\'' {
                in_single = false;
            }
        } else if in_double {
            if c == '"' {
                in_double = false;
            }
        } else {
            match c {
                '\'' => in_single = true,
                '"' => in_double = true,
                '-' if i + 1 < bytes.len() && bytes[i + 1] == '-' => in_line_comment = true,
                ';' => {
                    split_at = Some(i);
                    break;
                }
                _ => {}
            }
        }
        i += 1;
    }

    match split_at {
        Some(pos) => {
            let head: String = bytes[..pos].iter().collect();
            let tail: String = bytes[pos + 1..].iter().collect();
            let warning = if tail.trim().is_empty() {
                None
            } else {
                Some(format!(
                    "multiple statements returned; kept the first, discarded {} bytes",
                    tail.trim().len()
                ))
            };
            (head.trim().to_string(), warning)
        }
        None => (sql.trim().to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_labels() {
        let raw = "Here is your query:\n```sql\nSELECT 1 FROM t\n```\nHope that helps!";
        assert_eq!(strip_to_sql(raw), "SELECT 1 FROM t");
        assert_eq!(strip_to_sql("SQL: SELECT a FROM b"), "SELECT a FROM b");
    }

    #[test]
    fn keeps_from_first_sql_line() {
        let raw = "Sure thing.\nSELECT region FROM orders";
        assert_eq!(strip_to_sql(raw), "SELECT region FROM orders");
    }

    #[test]
    fn clarification_marker_detected() {
        let sql = "-- ERROR: cannot resolve 'cohort'\n-- available: REGION, SALES_AMOUNT";
        let message = extract_clarification(sql).expect("marker");
        assert!(message.contains("cohort"));
        assert!(message.contains("REGION"));
        assert!(extract_clarification("SELECT 1").is_none());
    }

    #[test]
    fn confidence_extracted_and_stripped() {
        let (sql, confidence) = extract_confidence("SELECT 1 FROM t\n-- CONFIDENCE: 85%");
        assert_eq!(sql, "SELECT 1 FROM t");
        assert_eq!(confidence, Some(85));
        let (_, none) = extract_confidence("SELECT 1 FROM t");
        assert_eq!(none, None);
        let (_, clamped) = extract_confidence("SELECT 1\n-- CONFIDENCE: 250%");
        assert_eq!(clamped, Some(100));
    }

    #[test]
    fn multi_statement_truncates_with_warning() {
        let (sql, warning) = first_statement("SELECT 1 FROM t; DROP TABLE t");
        assert_eq!(sql, "SELECT 1 FROM t");
        assert!(warning.is_some());
    }

    #[test]
    fn semicolons_in_strings_do_not_split() {
        let (sql, warning) = first_statement("SELECT ';' AS c FROM t");
        assert_eq!(sql, "SELECT ';' AS c FROM t");
        assert!(warning.is_none());
    }

    #[test]
    fn trailing_semicolon_is_not_a_second_statement() {
        let (sql, warning) = first_statement("SELECT 1 FROM t;");
        assert_eq!(sql, "SELECT 1 FROM t");
        assert!(warning.is_none());
    }
}
