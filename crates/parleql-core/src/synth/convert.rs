//! Dialect validation and best-effort conversion.
//!
//! Conversion is a translation aid, not a compiler: it rewrites the
//! well-known surface differences (row limiting, NVL, SYSDATE) and
//! reports everything else as a warning. Semantic equivalence is not
//! guaranteed and callers must surface the warnings.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};

fn parser_dialect(kind: DatabaseKind) -> Box<dyn Dialect> {
    match kind {
        DatabaseKind::Oracle => Box::new(GenericDialect {}),
        DatabaseKind::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseKind::Doris => Box::new(MySqlDialect {}),
    }
}

/// Check that `sql` parses under the target dialect's grammar.
pub fn validate_dialect(sql: &str, kind: DatabaseKind) -> std::result::Result<(), String> {
    let dialect = parser_dialect(kind);
    match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(_) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

static LIMIT_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)\s*$").expect("static regex"));
static FETCH_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFETCH\s+FIRST\s+(\d+)\s+ROWS?\s+ONLY\s*$").expect("static regex")
});
static NVL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bNVL\s*\(").expect("static regex"));
static SYSDATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bSYSDATE\b").expect("static regex"));
static NOW_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bNOW\s*\(\s*\)").expect("static regex"));
static ROWNUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bROWNUM\b").expect("static regex"));

/// Best-effort conversion between dialects.
///
/// Returns the converted SQL and the warnings accumulated along the way.
///
/// # Errors
///
/// [`ParleQLError::DialectConversionFailed`] when the converted text
/// still fails the target dialect's grammar.
pub fn convert(
    sql: &str,
    from: DatabaseKind,
    to: DatabaseKind,
) -> Result<(String, Vec<String>)> {
    let mut out = sql.to_string();
    let mut warnings = vec![format!("converted from {from} to {to}; review before reuse")];

    match to {
        DatabaseKind::Oracle => {
            if let Some(caps) = LIMIT_N.captures(&out) {
                let n: String = caps[1].to_string();
                out = LIMIT_N
                    .replace(&out, format!("FETCH FIRST {n} ROWS ONLY"))
                    .to_string();
            }
            out = NOW_CALL.replace_all(&out, "SYSDATE").to_string();
            if out.contains('`') {
                out = out.replace('`', "\"");
                warnings.push("backtick quoting rewritten to double quotes".to_string());
            }
        }
        DatabaseKind::Postgres | DatabaseKind::Doris => {
            if let Some(caps) = FETCH_FIRST.captures(&out) {
                let n: String = caps[1].to_string();
                out = FETCH_FIRST.replace(&out, format!("LIMIT {n}")).to_string();
            }
            out = NVL.replace_all(&out, "COALESCE(").to_string();
            out = SYSDATE.replace_all(&out, "CURRENT_DATE").to_string();
            if ROWNUM.is_match(&out) {
                warnings.push(
                    "ROWNUM has no direct equivalent; predicate left as-is".to_string(),
                );
            }
            if to == DatabaseKind::Doris && out.to_ascii_uppercase().contains("TO_CHAR(") {
                warnings.push("TO_CHAR is not supported by Doris; verify manually".to_string());
            }
        }
    }

    if let Err(e) = validate_dialect(&out, to) {
        return Err(ParleQLError::DialectConversionFailed {
            message: format!("converted SQL still fails {to} validation: {e}"),
        });
    }
    Ok((out, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_limit_becomes_oracle_fetch_first() {
        let (sql, warnings) = convert(
            "SELECT region FROM orders LIMIT 100",
            DatabaseKind::Postgres,
            DatabaseKind::Oracle,
        )
        .expect("converts");
        assert!(sql.ends_with("FETCH FIRST 100 ROWS ONLY"));
        assert!(!warnings.is_empty());
    }

    #[test]
    fn oracle_fetch_first_becomes_limit() {
        let (sql, _) = convert(
            "SELECT region FROM orders FETCH FIRST 50 ROWS ONLY",
            DatabaseKind::Oracle,
            DatabaseKind::Postgres,
        )
        .expect("converts");
        assert!(sql.ends_with("LIMIT 50"));
    }

    #[test]
    fn nvl_and_sysdate_rewritten_for_postgres() {
        let (sql, _) = convert(
            "SELECT NVL(region, 'n/a') FROM orders WHERE order_date < SYSDATE",
            DatabaseKind::Oracle,
            DatabaseKind::Postgres,
        )
        .expect("converts");
        assert!(sql.contains("COALESCE(region"));
        assert!(sql.contains("CURRENT_DATE"));
    }

    #[test]
    fn dialect_validation_flags_parse_failures() {
        assert!(validate_dialect("SELECT FROM WHERE", DatabaseKind::Postgres).is_err());
        assert!(validate_dialect("SELECT 1", DatabaseKind::Postgres).is_ok());
    }
}
