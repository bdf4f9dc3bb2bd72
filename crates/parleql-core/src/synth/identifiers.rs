//! Identifier normalization and allowlist validation.
//!
//! Both passes work on the token stream, not regexes, so quoted
//! mixed-case identifiers survive untouched (a known weakness of the
//! regex approach this replaces). Normalization is idempotent:
//! `normalize(normalize(sql)) == normalize(sql)`.

use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};

use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};
use crate::schema::SchemaSnapshot;

/// SQL functions generated queries may call.
pub const FUNCTION_ALLOWLIST: &[&str] = &[
    "SUM", "AVG", "COUNT", "MIN", "MAX", "TO_CHAR", "TO_DATE", "TO_NUMBER", "EXTRACT", "TRUNC",
    "ROUND", "SUBSTR", "SUBSTRING", "UPPER", "LOWER", "LENGTH", "COALESCE", "NVL", "NULLIF",
    "CAST", "DATE_TRUNC", "DATE", "NOW", "CURRENT_DATE", "CURRENT_TIMESTAMP", "ABS", "CEIL",
    "FLOOR", "MOD", "POWER", "GREATEST", "LEAST", "DECODE", "CONCAT", "REPLACE", "TRIM", "LAG",
    "LEAD", "ROW_NUMBER", "RANK", "DENSE_RANK", "YEAR", "MONTH", "QUARTER", "DAY", "SYSDATE",
];

fn sql_dialect(kind: DatabaseKind) -> Box<dyn Dialect> {
    match kind {
        // sqlparser has no Oracle dialect; Generic accepts the Oracle
        // surface this gateway emits.
        DatabaseKind::Oracle => Box::new(GenericDialect {}),
        DatabaseKind::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseKind::Doris => Box::new(MySqlDialect {}),
    }
}

fn tokenize(sql: &str, kind: DatabaseKind) -> Result<Vec<Token>> {
    let dialect = sql_dialect(kind);
    Tokenizer::new(dialect.as_ref(), sql)
        .tokenize()
        .map_err(|e| ParleQLError::sql_rejected(format!("unparseable SQL: {e}")))
}

/// Canonical name and quoting flag for a column, searched across all
/// relations.
fn canonical_column<'a>(schema: &'a SchemaSnapshot, name: &str) -> Option<(&'a str, bool)> {
    schema
        .tables
        .values()
        .chain(schema.views.values())
        .flatten()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .map(|c| (c.name.as_str(), c.requires_quoting))
}

/// Normalize identifiers against the schema.
///
/// Schema-known names are rewritten to their canonical case and quoted
/// where required; for Postgres, remaining unquoted identifiers are
/// folded to lower case the way the server would fold them.
pub fn normalize(sql: &str, schema: &SchemaSnapshot, kind: DatabaseKind) -> Result<String> {
    let tokens = tokenize(sql, kind)?;
    let mut out = String::with_capacity(sql.len() + 16);
    for token in tokens {
        match token {
            Token::Word(word) => {
                let rewritten = rewrite_word(&word, schema, kind);
                out.push_str(&rewritten.to_string());
            }
            other => out.push_str(&other.to_string()),
        }
    }
    Ok(out)
}

fn rewrite_word(word: &Word, schema: &SchemaSnapshot, kind: DatabaseKind) -> Word {
    // Table or view name.
    if let Some(canonical) = schema.canonical_table_name(&word.value) {
        let requires_quoting = kind.requires_quoting(canonical);
        return Word {
            value:       canonical.to_string(),
            quote_style: if requires_quoting {
                Some(kind.quote_char())
            } else {
                None
            },
            keyword:     Keyword::NoKeyword,
        };
    }
    // Column name.
    if let Some((canonical, requires_quoting)) = canonical_column(schema, &word.value) {
        return Word {
            value:       canonical.to_string(),
            quote_style: if requires_quoting {
                Some(kind.quote_char())
            } else {
                None
            },
            keyword:     Keyword::NoKeyword,
        };
    }
    // Postgres folds unquoted identifiers down; match it so generated
    // mixed-case aliases hit the stored casing. Quoted words and keywords
    // pass through untouched.
    if kind.folds_unquoted_to_lowercase()
        && word.quote_style.is_none()
        && word.keyword == Keyword::NoKeyword
    {
        return Word {
            value:       word.value.to_lowercase(),
            quote_style: None,
            keyword:     Keyword::NoKeyword,
        };
    }
    word.clone()
}

/// Validate that every identifier is a keyword, an allowlisted function,
/// a schema name, or an alias the statement itself introduces.
///
/// # Errors
///
/// [`ParleQLError::InvalidIdentifiers`] naming the offenders, in order of
/// appearance.
pub fn validate(sql: &str, schema: &SchemaSnapshot, kind: DatabaseKind) -> Result<()> {
    let tokens = tokenize(sql, kind)?;
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    // Pass 1: aliases. A word after AS, and a bare word directly after a
    // schema relation name ("FROM orders o").
    let mut aliases: Vec<String> = Vec::new();
    for (i, token) in significant.iter().enumerate() {
        let Token::Word(word) = token else { continue };
        if word.keyword == Keyword::AS {
            if let Some(Token::Word(next)) = significant.get(i + 1).copied() {
                aliases.push(next.value.to_ascii_uppercase());
            }
        }
        if schema.canonical_table_name(&word.value).is_some() {
            if let Some(Token::Word(next)) = significant.get(i + 1).copied() {
                if next.keyword == Keyword::NoKeyword {
                    aliases.push(next.value.to_ascii_uppercase());
                }
            }
        }
    }

    // Pass 2: every remaining bare word must resolve somewhere.
    let mut invalid: Vec<String> = Vec::new();
    for (i, token) in significant.iter().enumerate() {
        let Token::Word(word) = token else { continue };
        if word.keyword != Keyword::NoKeyword {
            continue;
        }
        let upper = word.value.to_ascii_uppercase();
        let is_function_call = matches!(significant.get(i + 1), Some(Token::LParen));
        if is_function_call {
            if !FUNCTION_ALLOWLIST.contains(&upper.as_str()) {
                invalid.push(word.value.clone());
            }
            continue;
        }
        if FUNCTION_ALLOWLIST.contains(&upper.as_str()) {
            // Niladic functions (SYSDATE, CURRENT_DATE) appear without parens.
            continue;
        }
        if schema.contains_identifier(&word.value)
            || aliases.contains(&upper)
        {
            continue;
        }
        if !invalid.contains(&word.value) {
            invalid.push(word.value.clone());
        }
    }

    if invalid.is_empty() {
        Ok(())
    } else {
        Err(ParleQLError::InvalidIdentifiers { identifiers: invalid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnInfo;
    use indexmap::IndexMap;

    fn schema() -> SchemaSnapshot {
        let mut tables = IndexMap::new();
        tables.insert(
            "ORDERS".to_string(),
            vec![
                ColumnInfo {
                    name: "REGION".to_string(),
                    data_type: "VARCHAR2(64)".to_string(),
                    nullable: true,
                    requires_quoting: false,
                },
                ColumnInfo {
                    name: "Sales Amount".to_string(),
                    data_type: "NUMBER".to_string(),
                    nullable: true,
                    requires_quoting: true,
                },
                ColumnInfo {
                    name: "ORDER_DATE".to_string(),
                    data_type: "DATE".to_string(),
                    nullable: false,
                    requires_quoting: false,
                },
            ],
        );
        SchemaSnapshot {
            tables,
            ..SchemaSnapshot::default()
        }
    }

    #[test]
    fn normalization_fixes_case_and_quotes() {
        let sql = r#"SELECT region, "Sales Amount" FROM orders"#;
        let normalized = normalize(sql, &schema(), DatabaseKind::Oracle).expect("normalizes");
        assert!(normalized.contains("REGION"));
        assert!(normalized.contains("ORDERS"));
        assert!(normalized.contains(r#""Sales Amount""#));
    }

    #[test]
    fn normalization_is_idempotent() {
        let sql = r#"SELECT region, "Sales Amount" FROM orders WHERE region = 'EU'"#;
        let once = normalize(sql, &schema(), DatabaseKind::Oracle).expect("once");
        let twice = normalize(&once, &schema(), DatabaseKind::Oracle).expect("twice");
        assert_eq!(once, twice);
    }

    #[test]
    fn postgres_downcases_unquoted_unknowns() {
        let sql = "SELECT region AS RegionName FROM orders";
        let normalized = normalize(sql, &schema(), DatabaseKind::Postgres).expect("normalizes");
        assert!(normalized.contains("regionname"));
        // Quoted mixed case is preserved verbatim.
        let quoted = r#"SELECT region AS "RegionName" FROM orders"#;
        let normalized = normalize(quoted, &schema(), DatabaseKind::Postgres).expect("normalizes");
        assert!(normalized.contains(r#""RegionName""#));
    }

    #[test]
    fn validation_accepts_schema_names_functions_and_aliases() {
        let sql = "SELECT o.REGION, SUM(o.ORDER_DATE) AS total FROM ORDERS o GROUP BY o.REGION";
        assert!(validate(sql, &schema(), DatabaseKind::Oracle).is_ok());
    }

    #[test]
    fn validation_names_the_offenders() {
        let sql = "SELECT cohort, REGION FROM ORDERS";
        let err = validate(sql, &schema(), DatabaseKind::Oracle).unwrap_err();
        match err {
            ParleQLError::InvalidIdentifiers { identifiers } => {
                assert_eq!(identifiers, vec!["cohort".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_functions_are_rejected() {
        let sql = "SELECT LOAD_FILE(REGION) FROM ORDERS";
        assert!(validate(sql, &schema(), DatabaseKind::Oracle).is_err());
    }
}
