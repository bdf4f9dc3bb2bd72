//! Property tests: identifier normalization is idempotent.

use indexmap::IndexMap;
use proptest::prelude::*;

use parleql_core::dialect::DatabaseKind;
use parleql_core::schema::{ColumnInfo, SchemaSnapshot};
use parleql_core::synth::identifiers;

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

/// Random casings of the schema's own identifiers.
fn cased(name: &'static str) -> impl Strategy<Value = String> {
    proptest::collection::vec(any::<bool>(), name.len()).prop_map(move |upper| {
        name.chars()
            .zip(upper)
            .map(|(c, up)| {
                if up {
                    c.to_ascii_uppercase()
                } else {
                    c.to_ascii_lowercase()
                }
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn normalization_is_idempotent_over_casings(
        table in cased("orders"),
        column in cased("region"),
        date in cased("order_date"),
        value in 0_u32..100_000,
        dialect in prop_oneof![
            Just(DatabaseKind::Oracle),
            Just(DatabaseKind::Postgres),
            Just(DatabaseKind::Doris),
        ],
    ) {
        let sql = format!(
            "SELECT {column}, \"Sales Amount\" FROM {table} WHERE {date} > {value}"
        );
        let snapshot = schema();
        let once = identifiers::normalize(&sql, &snapshot, dialect).expect("normalizes");
        let twice = identifiers::normalize(&once, &snapshot, dialect).expect("normalizes");
        prop_assert_eq!(&once, &twice);
        // Canonical names survive regardless of the input casing.
        prop_assert!(once.contains("ORDERS"));
        prop_assert!(once.contains("REGION"));
    }

    #[test]
    fn validation_never_panics_on_arbitrary_ascii(input in "[ -~]{0,120}") {
        let snapshot = schema();
        // Any outcome is fine; the property is absence of panics.
        let _ = identifiers::validate(&input, &snapshot, DatabaseKind::Postgres);
        let _ = identifiers::normalize(&input, &snapshot, DatabaseKind::Postgres);
    }
}
