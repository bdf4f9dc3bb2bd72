//! SQL injection detection.
//!
//! A pure, multi-layer pattern detector. Layer one is a table of regex
//! families (union-based, error-based, blind, stacked, out-of-band, ...);
//! layer two is behavioral analysis (OR-clause counts, comment counts,
//! nesting depth, hex blobs, high-entropy segments). Findings carry a
//! severity; the weighted risk score feeds the validator's escalation
//! decision.
//!
//! Two entry points: [`scan_sql`] runs every layer over generated SQL;
//! [`scan_user_text`] runs only the families that make sense over prose
//! (stacked statements, out-of-band, dangerous functions), so ordinary
//! questions are not over-flagged before the LLM ever runs.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational.
    Low,
    /// Worth a warning.
    Medium,
    /// Blocks execution.
    High,
    /// Blocks execution, definitely hostile.
    Critical,
}

impl Severity {
    /// Contribution to the risk score.
    #[must_use]
    pub const fn weight(self) -> u8 {
        match self {
            Self::Low => 5,
            Self::Medium => 15,
            Self::High => 30,
            Self::Critical => 50,
        }
    }
}

/// One injection finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectionFinding {
    /// Pattern family ("stacked_queries", "out_of_band", ...).
    pub kind: String,
    /// Severity.
    pub severity: Severity,
    /// The matched text (truncated).
    pub pattern: String,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// What to do about it.
    pub mitigation: String,
}

/// Scan output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Findings, in detection order.
    pub findings: Vec<InjectionFinding>,
    /// Weighted severity sum, capped at 100.
    pub risk_score: u8,
}

impl DetectionResult {
    /// Whether any finding is at blocking severity.
    #[must_use]
    pub fn has_blocking_finding(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity >= Severity::High)
    }
}

struct Family {
    kind: &'static str,
    severity: Severity,
    patterns: &'static LazyLock<Vec<Regex>>,
    mitigation: &'static str,
    /// Whether the family also applies to raw user text.
    pre_llm: bool,
}

macro_rules! patterns {
    ($name:ident, [$($p:expr),+ $(,)?]) => {
        static $name: LazyLock<Vec<Regex>> = LazyLock::new(|| {
            vec![$(Regex::new($p).expect("static regex")),+]
        });
    };
}

patterns!(UNION_BASED, [
    r"(?i)\bunion\s+select\b",
    r"(?i)\bunion\s+all\s+select\b",
    r"(?i)\bunion\s+distinct\s+select\b",
    r"(?i)\bunion\s+select\s+(?:chr\(|char\(|ascii\(|concat\()",
]);
patterns!(ERROR_BASED, [
    r"(?i)\b(?:and|or)\s+1\s*=\s*(?:1|0|convert|cast)\b",
    r"(?i)\b(?:or|and)\s+\d+\s*=\s*\d+\b",
    r#"(?i)\b(?:or|and)\s+'[^']*'\s*=\s*'"#,
    r"(?i)\b(?:or|and)\s+@@version\b",
    r"(?i)\b(?:or|and)\s+version\(\)",
]);
patterns!(BOOLEAN_BLIND, [
    r"(?i)\b(?:and|or)\s+\(?\s*select\s+.*\s+from\s+",
    r"(?i)\b(?:and|or)\s+exists\s*\(",
    r"(?i)\b(?:and|or)\s+length\s*\(",
    r"(?i)\b(?:and|or)\s+substr(?:ing)?\s*\(",
    r"(?i)\b(?:and|or)\s+ascii\s*\(",
]);
patterns!(TIME_BLIND, [
    r"(?i)\b(?:waitfor|sleep|benchmark|pg_sleep|dbms_lock\.sleep)\b",
    r"(?i);\s*waitfor\s+",
    r"(?i)\bsleep\s*\(\s*\d+",
    r"(?i)\bbenchmark\s*\(\s*\d+",
]);
patterns!(STACKED_QUERIES, [
    r"(?i);\s*(?:delete|drop|insert|update|create|alter|exec|execute|truncate)\b",
    r"(?i);\s*(?:shutdown|backup|restore|grant|revoke)\b",
    r"(?i)\bexec(?:ute)?\s*\(\s*'",
    r"(?i);\s*declare\s+@",
]);
patterns!(COMMENT_INJECTION, [
    r"(?i)--\s+'",
    r#"(?i)--\s+""#,
    r"(?i)/\*.*\*/",
]);
patterns!(STRING_ESCAPE, [
    r"(?i)'\s*(?:or|and)\s*'\s*'",
    r"(?i)'\s*(?:or|and)\s*\d+\s*=\s*\d+",
    r"(?i)'\s+(?:union|select|insert|delete|update)\b",
    r"(?i)'\s*;\s*(?:drop|delete|truncate)\b",
]);
patterns!(OUT_OF_BAND, [
    r"(?i)\bload_file\s*\(",
    r"(?i)\binto\s+outfile\b",
    r"(?i)\bpg_read_file\s*\(",
    r"(?i)\bcopy\s+.+\s+to\s+",
    r"(?i)\butl_(?:http|inaddr|tcp|smtp)\.",
    r"(?i)\bxp_cmdshell\b",
    r"(?i)\bbulk\s+insert\b",
]);
patterns!(STORED_PROCEDURE, [
    r"(?i)\b(?:exec|execute)\s+\w+\s+@",
    r"(?i)\b(?:exec|execute)\s+sp_",
    r"(?i)\b(?:exec|execute)\s+xp_",
    r"(?i);\s*(?:exec|execute)\s+",
]);
patterns!(SUBQUERY_INJECTION, [
    r"(?i)\)\s*union\s*select",
    r"(?i)\)\s*insert\s+into",
    r"(?i)\)\s*delete\s+from",
]);
patterns!(DANGEROUS_FUNCTIONS, [
    r"(?i)\bsys_eval\s*\(",
    r"(?i)\bsys_exec\s*\(",
    r"(?i)\bpg_read_file\s*\(",
    r"(?i)\bpg_write_file\s*\(",
    r"(?i)\bpg_ls_dir\s*\(",
]);
patterns!(OBFUSCATION, [
    r"%[0-9a-fA-F]{2}",
    r"\\x[0-9a-fA-F]{2}",
    r"\\u[0-9a-fA-F]{4}",
    r"(?i)char\s*\(\s*\d+",
    r"(?i)chr\s*\(\s*\d+",
]);

const FAMILIES: &[Family] = &[
    Family {
        kind: "union_based",
        severity: Severity::High,
        patterns: &UNION_BASED,
        mitigation: "remove the UNION clause; ask one question at a time",
        pre_llm: false,
    },
    Family {
        kind: "error_based",
        severity: Severity::Medium,
        patterns: &ERROR_BASED,
        mitigation: "remove tautological predicates",
        pre_llm: false,
    },
    Family {
        kind: "boolean_blind",
        severity: Severity::High,
        patterns: &BOOLEAN_BLIND,
        mitigation: "remove probing subqueries from predicates",
        pre_llm: false,
    },
    Family {
        kind: "time_blind",
        severity: Severity::Critical,
        patterns: &TIME_BLIND,
        mitigation: "remove timing functions",
        pre_llm: true,
    },
    Family {
        kind: "stacked_queries",
        severity: Severity::Critical,
        patterns: &STACKED_QUERIES,
        mitigation: "submit a single read-only statement",
        pre_llm: true,
    },
    Family {
        kind: "comment_injection",
        severity: Severity::Medium,
        patterns: &COMMENT_INJECTION,
        mitigation: "remove SQL comments",
        pre_llm: false,
    },
    Family {
        kind: "string_escape",
        severity: Severity::High,
        patterns: &STRING_ESCAPE,
        mitigation: "remove quote-breaking sequences",
        pre_llm: false,
    },
    Family {
        kind: "out_of_band",
        severity: Severity::Critical,
        patterns: &OUT_OF_BAND,
        mitigation: "file and network access is not permitted",
        pre_llm: true,
    },
    Family {
        kind: "stored_procedure",
        severity: Severity::High,
        patterns: &STORED_PROCEDURE,
        mitigation: "stored procedure calls are not permitted",
        pre_llm: true,
    },
    Family {
        kind: "subquery_injection",
        severity: Severity::High,
        patterns: &SUBQUERY_INJECTION,
        mitigation: "remove the trailing statement after the subquery",
        pre_llm: false,
    },
    Family {
        kind: "dangerous_function",
        severity: Severity::Critical,
        patterns: &DANGEROUS_FUNCTIONS,
        mitigation: "system functions are not permitted",
        pre_llm: true,
    },
    Family {
        kind: "obfuscated_input",
        severity: Severity::Medium,
        patterns: &OBFUSCATION,
        mitigation: "submit plain-text SQL without encoded segments",
        pre_llm: false,
    },
];

static OR_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bor\b").expect("static regex"));
static LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"--").expect("static regex"));
static HEX_BLOB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]{16,}").expect("static regex"));

/// Full scan over generated (or user-modified) SQL.
#[must_use]
pub fn scan_sql(sql: &str) -> DetectionResult {
    let mut result = scan(sql, false);
    behavioral(sql, &mut result);
    result.risk_score = score(&result.findings);
    result
}

/// Pre-LLM scan over raw user text. Only the families whose patterns are
/// unambiguous in prose participate.
#[must_use]
pub fn scan_user_text(text: &str) -> DetectionResult {
    let mut result = scan(text, true);
    result.risk_score = score(&result.findings);
    result
}

fn scan(input: &str, pre_llm_only: bool) -> DetectionResult {
    let mut findings = Vec::new();
    for family in FAMILIES {
        if pre_llm_only && !family.pre_llm {
            continue;
        }
        for pattern in family.patterns.iter() {
            if let Some(m) = pattern.find(input) {
                findings.push(InjectionFinding {
                    kind: family.kind.to_string(),
                    severity: family.severity,
                    pattern: truncate(m.as_str(), 60),
                    confidence: confidence_for(m.as_str(), input),
                    mitigation: family.mitigation.to_string(),
                });
                break; // one finding per family is enough
            }
        }
    }
    DetectionResult {
        findings,
        risk_score: 0,
    }
}

fn behavioral(sql: &str, result: &mut DetectionResult) {
    let or_count = OR_CLAUSE.find_iter(sql).count();
    if or_count > 5 {
        result.findings.push(InjectionFinding {
            kind: "excessive_or_clauses".to_string(),
            severity: Severity::Medium,
            pattern: format!("{or_count} OR clauses"),
            confidence: 0.6,
            mitigation: "simplify the predicate".to_string(),
        });
    }
    let comment_count = LINE_COMMENT.find_iter(sql).count();
    if comment_count > 2 {
        result.findings.push(InjectionFinding {
            kind: "excessive_comments".to_string(),
            severity: Severity::Low,
            pattern: format!("{comment_count} comment markers"),
            confidence: 0.5,
            mitigation: "remove comments".to_string(),
        });
    }
    let depth = max_paren_depth(sql);
    if depth > 4 {
        result.findings.push(InjectionFinding {
            kind: "deep_nesting".to_string(),
            severity: Severity::Low,
            pattern: format!("nesting depth {depth}"),
            confidence: 0.5,
            mitigation: "flatten the subqueries".to_string(),
        });
    }
    if let Some(m) = HEX_BLOB.find(sql) {
        result.findings.push(InjectionFinding {
            kind: "hex_blob".to_string(),
            severity: Severity::Medium,
            pattern: truncate(m.as_str(), 24),
            confidence: 0.7,
            mitigation: "remove hex literals".to_string(),
        });
    }
    if let Some(segment) = high_entropy_segment(sql) {
        result.findings.push(InjectionFinding {
            kind: "high_entropy".to_string(),
            severity: Severity::Low,
            pattern: truncate(&segment, 24),
            confidence: 0.4,
            mitigation: "remove opaque encoded segments".to_string(),
        });
    }
}

fn score(findings: &[InjectionFinding]) -> u8 {
    findings
        .iter()
        .map(|f| u32::from(f.severity.weight()))
        .sum::<u32>()
        .min(100) as u8
}

fn confidence_for(matched: &str, input: &str) -> f32 {
    // Longer matches relative to the input read as more deliberate.
    let ratio = matched.len() as f32 / input.len().max(1) as f32;
    (0.6 + ratio).min(0.99)
}

fn max_paren_depth(sql: &str) -> usize {
    let mut depth = 0_usize;
    let mut max = 0_usize;
    for c in sql.chars() {
        match c {
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Shannon entropy over any single unquoted token longer than 24 chars;
/// above ~4.7 bits/char reads as encoded payload.
fn high_entropy_segment(sql: &str) -> Option<String> {
    for token in sql.split_whitespace() {
        if token.len() < 24 || token.starts_with('\'') {
            continue;
        }
        let mut counts = [0_u32; 256];
        for b in token.bytes() {
            counts[b as usize] += 1;
        }
        let len = token.len() as f64;
        let entropy: f64 = counts
            .iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = f64::from(c) / len;
                -p * p.log2()
            })
            .sum();
        if entropy > 4.7 {
            return Some(token.to_string());
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stacked_query_is_critical() {
        let result = scan_sql("SELECT * FROM users; DROP TABLE users");
        assert!(result.has_blocking_finding());
        assert!(result
            .findings
            .iter()
            .any(|f| f.kind == "stacked_queries" && f.severity == Severity::Critical));
    }

    #[test]
    fn stacked_query_detected_pre_llm() {
        let result = scan_user_text("show users; DROP TABLE users");
        assert!(result.has_blocking_finding());
    }

    #[test]
    fn plain_prose_is_clean_pre_llm() {
        let result = scan_user_text("total sales by region for 2024, or by country");
        assert!(result.findings.is_empty());
        assert_eq!(result.risk_score, 0);
    }

    #[test]
    fn union_select_is_high() {
        let result = scan_sql("SELECT a FROM t UNION SELECT password FROM users");
        assert!(result.has_blocking_finding());
    }

    #[test]
    fn oob_functions_are_critical() {
        for sql in [
            "SELECT load_file('/etc/passwd')",
            "SELECT * FROM t INTO OUTFILE '/tmp/x'",
            "SELECT UTL_HTTP.request('http://evil')",
            "EXEC xp_cmdshell 'dir'",
        ] {
            let result = scan_sql(sql);
            assert!(result.has_blocking_finding(), "not flagged: {sql}");
        }
    }

    #[test]
    fn excessive_or_clauses_scored_medium() {
        let sql = "SELECT a FROM t WHERE x=1 OR x=2 OR x=3 OR x=4 OR x=5 OR x=6 OR x=7";
        let result = scan_sql(sql);
        assert!(result
            .findings
            .iter()
            .any(|f| f.kind == "excessive_or_clauses"));
        assert!(!result.has_blocking_finding());
    }

    #[test]
    fn clean_select_scores_zero() {
        let result = scan_sql(
            "SELECT region, SUM(sales_amount) FROM orders WHERE yr = 2024 GROUP BY region",
        );
        assert_eq!(result.risk_score, 0);
        assert!(result.findings.is_empty());
    }

    #[test]
    fn risk_score_is_capped() {
        let sql = "'; DROP TABLE a; EXEC xp_cmdshell 'x'; SELECT sleep(10) UNION SELECT 1 -- ' --";
        let result = scan_sql(sql);
        assert!(result.risk_score <= 100);
        assert!(result.risk_score >= 50);
    }

    #[test]
    fn two_medium_findings_reach_escalation_threshold() {
        // One medium finding stays under 30; two cross it.
        let one = scan_sql("SELECT a FROM t WHERE x = 0x41414141414141414141");
        assert_eq!(one.risk_score, 15);
        let two = scan_sql("SELECT /* c */ a FROM t WHERE x = 0x41414141414141414141");
        assert_eq!(two.risk_score, 30);
    }
}
