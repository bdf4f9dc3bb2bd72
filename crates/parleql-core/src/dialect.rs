//! Backend dialects and their SQL surface differences.
//!
//! Everything dialect-specific the pipeline needs lives here: row-limiting
//! clauses, date-part expressions for derived temporal columns, identifier
//! quoting and case-folding rules, and the catalog queries the schema
//! fetcher issues.

use serde::{Deserialize, Serialize};

/// Supported database backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// Oracle (SQLcl subprocess protocol).
    Oracle,
    /// PostgreSQL.
    Postgres,
    /// Apache Doris (MySQL-compatible surface).
    Doris,
}

/// Date parts the skills engine can derive from a date column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePart {
    /// Calendar day (date truncation).
    Day,
    /// Month number.
    Month,
    /// Quarter number.
    Quarter,
    /// Year number.
    Year,
}

impl DatabaseKind {
    /// Parse from the wire name used in request bodies.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "oracle" => Some(Self::Oracle),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "doris" => Some(Self::Doris),
            _ => None,
        }
    }

    /// Wire name as used in request/response bodies and cache keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::Postgres => "postgres",
            Self::Doris => "doris",
        }
    }

    /// The row-limiting clause for this dialect.
    ///
    /// Oracle uses `FETCH FIRST n ROWS ONLY`; Postgres and Doris use `LIMIT`.
    #[must_use]
    pub fn limit_clause(self, n: u64) -> String {
        match self {
            Self::Oracle => format!("FETCH FIRST {n} ROWS ONLY"),
            Self::Postgres | Self::Doris => format!("LIMIT {n}"),
        }
    }

    /// Render a derived date-part expression over a (table-qualified) column.
    ///
    /// The returned expression is substitutable verbatim into SELECT and
    /// GROUP BY lists.
    #[must_use]
    pub fn date_part_expr(self, part: DatePart, qualified_column: &str) -> String {
        match (self, part) {
            (Self::Oracle, DatePart::Day) => format!("TRUNC({qualified_column})"),
            (Self::Oracle, DatePart::Month) => format!("TO_CHAR({qualified_column}, 'MM')"),
            (Self::Oracle, DatePart::Quarter) => format!("TO_CHAR({qualified_column}, 'Q')"),
            (Self::Oracle, DatePart::Year) => {
                format!("EXTRACT(YEAR FROM {qualified_column})")
            }
            (Self::Postgres, DatePart::Day) => format!("DATE_TRUNC('day', {qualified_column})"),
            (Self::Doris, DatePart::Day) => format!("DATE({qualified_column})"),
            (Self::Postgres | Self::Doris, DatePart::Month) => {
                format!("EXTRACT(MONTH FROM {qualified_column})")
            }
            (Self::Postgres | Self::Doris, DatePart::Quarter) => {
                format!("EXTRACT(QUARTER FROM {qualified_column})")
            }
            (Self::Postgres | Self::Doris, DatePart::Year) => {
                format!("EXTRACT(YEAR FROM {qualified_column})")
            }
        }
    }

    /// Quote character for identifiers that require quoting.
    ///
    /// Doris follows the MySQL backtick convention; Oracle and Postgres use
    /// double quotes.
    #[must_use]
    pub const fn quote_char(self) -> char {
        match self {
            Self::Oracle | Self::Postgres => '"',
            Self::Doris => '`',
        }
    }

    /// How an unquoted identifier folds in this dialect.
    ///
    /// Oracle folds up, Postgres folds down, Doris preserves case for
    /// table names but is case-insensitive for columns (treated as
    /// preserve here).
    #[must_use]
    pub const fn folds_unquoted_to_lowercase(self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Whether `name` needs quoting in this dialect.
    ///
    /// A name needs quotes if it is not a bare `[A-Za-z][A-Za-z0-9_]*`
    /// identifier, or if its stored casing differs from the dialect's
    /// unquoted folding.
    #[must_use]
    pub fn requires_quoting(self, name: &str) -> bool {
        let bare = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !bare {
            return true;
        }
        match self {
            // Oracle reports canonical names in upper case; anything else
            // was created quoted.
            Self::Oracle => name != name.to_ascii_uppercase(),
            Self::Postgres => name != name.to_ascii_lowercase(),
            Self::Doris => false,
        }
    }

    /// Quote an identifier, doubling embedded quote characters.
    #[must_use]
    pub fn quote_identifier(self, name: &str) -> String {
        let q = self.quote_char();
        let doubled = name.replace(q, &format!("{q}{q}"));
        format!("{q}{doubled}{q}")
    }

    /// Catalog query listing tables visible to the connected user.
    ///
    /// Result shape: one column, the table name in the backend's canonical
    /// case.
    #[must_use]
    pub const fn catalog_tables_sql(self) -> &'static str {
        match self {
            Self::Oracle => "SELECT table_name FROM user_tables ORDER BY table_name",
            Self::Postgres => {
                "SELECT tablename FROM pg_catalog.pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY tablename"
            }
            Self::Doris => "SHOW TABLES",
        }
    }

    /// The backend-specific mechanism for killing an in-flight session.
    #[must_use]
    pub fn kill_session_sql(self, session_id: &str) -> String {
        match self {
            Self::Oracle => format!("ALTER SYSTEM KILL SESSION '{session_id}' IMMEDIATE"),
            Self::Postgres => format!("SELECT pg_terminate_backend({session_id})"),
            Self::Doris => format!("KILL QUERY {session_id}"),
        }
    }
}

impl std::fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_postgresql_alias() {
        assert_eq!(DatabaseKind::parse("postgresql"), Some(DatabaseKind::Postgres));
        assert_eq!(DatabaseKind::parse("ORACLE"), Some(DatabaseKind::Oracle));
        assert_eq!(DatabaseKind::parse("mysql"), None);
    }

    #[test]
    fn oracle_limits_with_fetch_first() {
        assert_eq!(
            DatabaseKind::Oracle.limit_clause(500),
            "FETCH FIRST 500 ROWS ONLY"
        );
        assert_eq!(DatabaseKind::Postgres.limit_clause(1000), "LIMIT 1000");
    }

    #[test]
    fn quarter_expressions_are_dialect_specific() {
        assert_eq!(
            DatabaseKind::Oracle.date_part_expr(DatePart::Quarter, "o.ORDER_DATE"),
            "TO_CHAR(o.ORDER_DATE, 'Q')"
        );
        assert_eq!(
            DatabaseKind::Postgres.date_part_expr(DatePart::Quarter, "o.order_date"),
            "EXTRACT(QUARTER FROM o.order_date)"
        );
    }

    #[test]
    fn quoting_rules_follow_case_folding() {
        // Oracle canonical case is upper; mixed case means quoted-at-creation.
        assert!(DatabaseKind::Oracle.requires_quoting("OrderDate"));
        assert!(!DatabaseKind::Oracle.requires_quoting("ORDER_DATE"));
        // Postgres folds down.
        assert!(DatabaseKind::Postgres.requires_quoting("OrderDate"));
        assert!(!DatabaseKind::Postgres.requires_quoting("order_date"));
        // Non-bare names always quote.
        assert!(DatabaseKind::Doris.requires_quoting("total sales"));
    }

    #[test]
    fn quote_identifier_doubles_embedded_quotes() {
        assert_eq!(
            DatabaseKind::Postgres.quote_identifier(r#"odd"name"#),
            r#""odd""name""#
        );
        assert_eq!(DatabaseKind::Doris.quote_identifier("col"), "`col`");
    }
}
