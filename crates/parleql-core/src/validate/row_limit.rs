//! Role-based row-limit enforcement.
//!
//! SELECTs are rewritten to cap rows at the caller's role limit, using
//! the dialect's limiting clause. The role cap applies first, then the
//! hard safety cap; the effective limit is the smaller of the two. An
//! existing limit below the cap is left alone.

use std::sync::LazyLock;

use regex::Regex;

use crate::dialect::DatabaseKind;

/// Hard safety cap applied after the role cap.
pub const HARD_ROW_CAP: u64 = 1000;

static LIMIT_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bLIMIT\s+(\d+)").expect("static regex"));
static FETCH_N: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bFETCH\s+FIRST\s+(\d+)\s+ROWS?\s+ONLY").expect("static regex")
});

/// Enforce a row cap on a SELECT.
///
/// `role_cap = None` (admin) applies no rewrite. Returns the rewritten
/// SQL and whether anything changed.
#[must_use]
pub fn enforce(sql: &str, dialect: DatabaseKind, role_cap: Option<u64>) -> (String, bool) {
    let Some(role_cap) = role_cap else {
        return (sql.to_string(), false);
    };
    let effective = role_cap.min(HARD_ROW_CAP);

    let existing = LIMIT_N
        .captures(sql)
        .or_else(|| FETCH_N.captures(sql))
        .and_then(|caps| caps[1].parse::<u64>().ok());

    match existing {
        Some(n) if n <= effective => (sql.to_string(), false),
        Some(_) => {
            // Tighten the existing clause down to the cap.
            let tightened = LIMIT_N
                .replace(sql, format!("LIMIT {effective}"))
                .to_string();
            let tightened = FETCH_N
                .replace(&tightened, format!("FETCH FIRST {effective} ROWS ONLY"))
                .to_string();
            (tightened, true)
        }
        None => {
            let trimmed = sql.trim_end().trim_end_matches(';');
            (
                format!("{trimmed} {}", dialect.limit_clause(effective)),
                true,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_dialect_clause_when_missing() {
        let (sql, changed) = enforce(
            "SELECT region FROM orders",
            DatabaseKind::Oracle,
            Some(500),
        );
        assert!(changed);
        assert!(sql.ends_with("FETCH FIRST 500 ROWS ONLY"));

        let (sql, _) = enforce("SELECT region FROM orders", DatabaseKind::Postgres, Some(500));
        assert!(sql.ends_with("LIMIT 500"));
    }

    #[test]
    fn role_cap_is_bounded_by_hard_cap() {
        let (sql, _) = enforce("SELECT region FROM orders", DatabaseKind::Postgres, Some(50_000));
        assert!(sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn existing_limit_below_cap_is_kept() {
        let (sql, changed) =
            enforce("SELECT region FROM orders LIMIT 10", DatabaseKind::Postgres, Some(500));
        assert!(!changed);
        assert!(sql.ends_with("LIMIT 10"));
    }

    #[test]
    fn existing_limit_above_cap_is_tightened() {
        let (sql, changed) =
            enforce("SELECT region FROM orders LIMIT 99999", DatabaseKind::Postgres, Some(500));
        assert!(changed);
        assert!(sql.ends_with("LIMIT 500"));
    }

    #[test]
    fn admin_is_unlimited() {
        let (sql, changed) = enforce("SELECT region FROM orders", DatabaseKind::Postgres, None);
        assert!(!changed);
        assert_eq!(sql, "SELECT region FROM orders");
    }
}
