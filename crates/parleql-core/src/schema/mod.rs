//! Schema snapshots and fingerprinting.
//!
//! A [`SchemaSnapshot`] is the read-only view of one backend's physical
//! schema that the router, skills engine, synthesizer, and validator all
//! consult. Snapshots are fetched through the driver, cached in the KV
//! store with a TTL, and shared across tickets.

pub mod cache;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::dialect::DatabaseKind;
use crate::driver::ColumnDescriptor;

pub use cache::SchemaService;

/// One column of a table or view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Canonical-case name as reported by the backend.
    pub name: String,
    /// Backend type name, upper-cased for matching.
    pub data_type: String,
    /// Whether NULLs are allowed.
    pub nullable: bool,
    /// Whether the name must be quoted in generated SQL.
    pub requires_quoting: bool,
}

impl ColumnInfo {
    /// Promote a raw catalog descriptor, computing the quoting flag for
    /// the dialect.
    #[must_use]
    pub fn from_descriptor(desc: &ColumnDescriptor, kind: DatabaseKind) -> Self {
        Self {
            name: desc.name.clone(),
            data_type: desc.data_type.to_ascii_uppercase(),
            nullable: desc.nullable,
            requires_quoting: kind.requires_quoting(&desc.name),
        }
    }

    /// Whether the type is date-like (DATE/TIMESTAMP family).
    #[must_use]
    pub fn is_temporal(&self) -> bool {
        self.data_type.starts_with("DATE") || self.data_type.starts_with("TIMESTAMP")
    }

    /// Whether the type is numeric.
    #[must_use]
    pub fn is_numeric(&self) -> bool {
        const NUMERIC: [&str; 8] = [
            "NUMBER", "NUMERIC", "DECIMAL", "FLOAT", "DOUBLE", "INT", "BIGINT", "REAL",
        ];
        NUMERIC.iter().any(|t| self.data_type.starts_with(t))
    }
}

/// A derived-column hint attached to a table (metric library entries,
/// curated expressions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedHint {
    /// Business concept the expression answers.
    pub concept: String,
    /// SQL expression, substitutable verbatim.
    pub expression: String,
    /// Provenance note.
    pub note: String,
}

/// One foreign-key edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Referencing table.
    pub from_table: String,
    /// Referencing column.
    pub from_column: String,
    /// Referenced table.
    pub to_table: String,
    /// Referenced column.
    pub to_column: String,
}

/// Read-only snapshot of one backend's schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    /// Tables, in catalog order, each with ordered columns.
    pub tables: IndexMap<String, Vec<ColumnInfo>>,
    /// Views, same shape.
    #[serde(default)]
    pub views: IndexMap<String, Vec<ColumnInfo>>,
    /// Per-table derived-expression hints.
    #[serde(default)]
    pub derived_hints: IndexMap<String, Vec<DerivedHint>>,
    /// Per-table sample rows (first-N probes), for prompting only.
    #[serde(default)]
    pub samples: IndexMap<String, Vec<Vec<JsonValue>>>,
    /// Foreign-key edges, ordered.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl SchemaSnapshot {
    /// Columns of a table or view, looked up case-insensitively.
    /// Tables shadow views on a name collision.
    #[must_use]
    pub fn columns_of(&self, name: &str) -> Option<&[ColumnInfo]> {
        self.lookup(&self.tables, name)
            .or_else(|| self.lookup(&self.views, name))
    }

    /// Canonical name of a table or view, looked up case-insensitively.
    #[must_use]
    pub fn canonical_table_name(&self, name: &str) -> Option<&str> {
        self.tables
            .keys()
            .chain(self.views.keys())
            .find(|k| k.eq_ignore_ascii_case(name))
            .map(String::as_str)
    }

    /// Whether any table, view, or column carries this name
    /// (case-insensitive).
    #[must_use]
    pub fn contains_identifier(&self, name: &str) -> bool {
        if self.canonical_table_name(name).is_some() {
            return true;
        }
        self.tables
            .values()
            .chain(self.views.values())
            .flatten()
            .any(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// All table and view names, tables first.
    #[must_use]
    pub fn all_relation_names(&self) -> Vec<&str> {
        self.tables
            .keys()
            .chain(self.views.keys())
            .map(String::as_str)
            .collect()
    }

    /// Tables and views whose names appear as words in free text.
    ///
    /// Matching is case-insensitive on word boundaries, so a prompt
    /// mentioning "orders" finds the `ORDERS` table.
    #[must_use]
    pub fn tables_mentioned_in(&self, text: &str) -> Vec<String> {
        let lowered = text.to_ascii_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();
        self.all_relation_names()
            .into_iter()
            .filter(|name| {
                let n = name.to_ascii_lowercase();
                words.iter().any(|w| *w == n || singularized(w) == n)
            })
            .map(ToString::to_string)
            .collect()
    }

    /// Stable fingerprint over relation names and column names/types.
    ///
    /// Ordering is normalized by sorting, so two snapshots with the same
    /// content hash identically regardless of catalog order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (prefix, relations) in [("t", &self.tables), ("v", &self.views)] {
            for (name, columns) in relations {
                let cols: Vec<String> = columns
                    .iter()
                    .map(|c| format!("{}:{}", c.name, c.data_type))
                    .collect();
                lines.push(format!("{prefix}/{name}={}", cols.join(",")));
            }
        }
        lines.sort();
        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    fn lookup<'a>(
        &self,
        map: &'a IndexMap<String, Vec<ColumnInfo>>,
        name: &str,
    ) -> Option<&'a [ColumnInfo]> {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

/// Trailing-s singularization for table-mention matching ("orders" vs
/// a table named ORDER and vice versa).
fn singularized(word: &str) -> &str {
    word.strip_suffix('s').unwrap_or(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SchemaSnapshot {
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
                    name: "SALES_AMOUNT".to_string(),
                    data_type: "NUMBER(12,2)".to_string(),
                    nullable: true,
                    requires_quoting: false,
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
    fn case_insensitive_lookup() {
        let snap = snapshot();
        assert!(snap.columns_of("orders").is_some());
        assert_eq!(snap.canonical_table_name("Orders"), Some("ORDERS"));
        assert!(snap.contains_identifier("sales_amount"));
        assert!(!snap.contains_identifier("cohort"));
    }

    #[test]
    fn mentions_match_on_word_boundaries_and_plurals() {
        let snap = snapshot();
        assert_eq!(
            snap.tables_mentioned_in("total sales from orders by region"),
            vec!["ORDERS".to_string()]
        );
        // "orders," with punctuation still matches.
        assert_eq!(
            snap.tables_mentioned_in("show orders, please").len(),
            1
        );
        assert!(snap.tables_mentioned_in("revenue by cohort").is_empty());
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = snapshot();
        let mut b = snapshot();
        // Same content, different catalog order of columns per table keeps
        // the same fingerprint line (columns are part of one line), but a
        // reordered table map must hash identically.
        b.tables.insert(
            "REGIONS".to_string(),
            vec![ColumnInfo {
                name: "NAME".to_string(),
                data_type: "VARCHAR2(64)".to_string(),
                nullable: false,
                requires_quoting: false,
            }],
        );
        let mut c = SchemaSnapshot::default();
        c.tables.insert(
            "REGIONS".to_string(),
            b.tables.get("REGIONS").cloned().unwrap_or_default(),
        );
        c.tables.insert(
            "ORDERS".to_string(),
            b.tables.get("ORDERS").cloned().unwrap_or_default(),
        );
        assert_eq!(b.fingerprint(), c.fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn temporal_and_numeric_detection() {
        let snap = snapshot();
        let cols = snap.columns_of("ORDERS").expect("columns");
        assert!(cols[2].is_temporal());
        assert!(cols[1].is_numeric());
        assert!(!cols[0].is_numeric());
    }
}
