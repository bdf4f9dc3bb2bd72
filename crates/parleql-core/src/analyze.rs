//! Post-execution analysis: visualization hints, a narrative line, and
//! data-quality stats.
//!
//! Pure functions over the canonical result shape. The chart heuristic
//! is deliberately small: temporal first column reads as a series, a
//! short categorical/numeric pair reads as a bar (or pie when the values
//! look like shares), everything else stays a table.

use serde_json::Value as JsonValue;

use crate::types::{ChartKind, DataQuality, ExecutionResult, Visualization};

/// Infer a chart suggestion and narrative for a successful result.
#[must_use]
pub fn visualization_for(result: &ExecutionResult) -> Visualization {
    let narrative = narrative_for(result);
    if result.rows.is_empty() || result.columns.len() < 2 {
        return Visualization {
            kind: ChartKind::Table,
            x_axis: None,
            y_axis: None,
            reason: "not enough shape for a chart".to_string(),
            narrative,
        };
    }

    let first_temporal = looks_temporal(&result.columns[0], &result.rows);
    let numeric_column = result
        .columns
        .iter()
        .enumerate()
        .skip(1)
        .find(|(i, _)| column_is_numeric(*i, &result.rows));

    match (first_temporal, numeric_column) {
        (true, Some((_, y))) => Visualization {
            kind: ChartKind::Line,
            x_axis: Some(result.columns[0].clone()),
            y_axis: Some(y.clone()),
            reason: "temporal first column suggests a time series".to_string(),
            narrative,
        },
        (false, Some((y_idx, y))) if result.rows.len() <= 12 => {
            let kind = if values_look_like_shares(y_idx, &result.rows) {
                ChartKind::Pie
            } else {
                ChartKind::Bar
            };
            Visualization {
                kind,
                x_axis: Some(result.columns[0].clone()),
                y_axis: Some(y.clone()),
                reason: "few categories with one numeric measure".to_string(),
                narrative,
            }
        }
        _ => Visualization {
            kind: ChartKind::Table,
            x_axis: None,
            y_axis: None,
            reason: "no clear categorical/numeric pairing".to_string(),
            narrative,
        },
    }
}

/// One-sentence result summary.
#[must_use]
pub fn narrative_for(result: &ExecutionResult) -> String {
    if result.rows.is_empty() {
        return "The query returned no rows.".to_string();
    }
    let leading = result.columns.first().map_or(String::new(), |c| {
        let distinct: std::collections::HashSet<String> = result
            .rows
            .iter()
            .filter_map(|r| r.first())
            .map(render_value)
            .collect();
        format!(" across {} distinct {}", distinct.len(), c.to_lowercase())
    });
    format!(
        "The query returned {} row{}{} in {}ms.",
        result.row_count,
        if result.row_count == 1 { "" } else { "s" },
        leading,
        result.execution_time_ms
    )
}

/// Nullability and duplicate stats for the result.
#[must_use]
pub fn data_quality_for(result: &ExecutionResult) -> DataQuality {
    let mut null_counts = vec![0_u64; result.columns.len()];
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            if value.is_null() {
                if let Some(slot) = null_counts.get_mut(i) {
                    *slot += 1;
                }
            }
        }
    }
    let mut seen = std::collections::HashSet::new();
    let mut duplicate_rows = 0_u64;
    for row in &result.rows {
        let rendered = serde_json::to_string(row).unwrap_or_default();
        if !seen.insert(rendered) {
            duplicate_rows += 1;
        }
    }
    DataQuality {
        null_counts,
        duplicate_rows,
    }
}

fn render_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn looks_temporal(name: &str, rows: &[Vec<JsonValue>]) -> bool {
    let upper = name.to_ascii_uppercase();
    if ["DATE", "DAY", "MONTH", "QUARTER", "YEAR", "TIME", "DT", "TS"]
        .iter()
        .any(|t| upper.contains(t))
    {
        return true;
    }
    !rows.is_empty()
        && rows
            .iter()
            .filter_map(|r| r.first())
            .take(3)
            .all(|v| match v {
                JsonValue::String(s) => {
                    s.len() >= 8 && s.chars().take(4).all(|c| c.is_ascii_digit())
                }
                _ => false,
            })
}

fn column_is_numeric(index: usize, rows: &[Vec<JsonValue>]) -> bool {
    rows.iter()
        .filter_map(|r| r.get(index))
        .all(|v| v.is_number() || v.is_null())
        && rows.iter().filter_map(|r| r.get(index)).any(JsonValue::is_number)
}

/// Positive values summing to roughly 100 (or 1.0) read as percentages.
fn values_look_like_shares(index: usize, rows: &[Vec<JsonValue>]) -> bool {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|r| r.get(index))
        .filter_map(JsonValue::as_f64)
        .collect();
    if values.is_empty() || values.iter().any(|v| *v < 0.0) {
        return false;
    }
    let sum: f64 = values.iter().sum();
    (99.0..=101.0).contains(&sum) || (0.99..=1.01).contains(&sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionResult;
    use serde_json::json;

    fn result(columns: &[&str], rows: Vec<Vec<JsonValue>>) -> ExecutionResult {
        ExecutionResult::success(
            columns.iter().map(ToString::to_string).collect(),
            rows,
            12,
        )
    }

    #[test]
    fn temporal_first_column_suggests_line() {
        let r = result(
            &["order_month", "total_sales"],
            vec![
                vec![json!("2024-01"), json!(100)],
                vec![json!("2024-02"), json!(140)],
            ],
        );
        let viz = visualization_for(&r);
        assert_eq!(viz.kind, ChartKind::Line);
        assert_eq!(viz.x_axis.as_deref(), Some("order_month"));
        assert_eq!(viz.y_axis.as_deref(), Some("total_sales"));
    }

    #[test]
    fn few_categories_suggest_bar() {
        let r = result(
            &["region", "total_sales"],
            vec![
                vec![json!("EU"), json!(500)],
                vec![json!("US"), json!(700)],
            ],
        );
        assert_eq!(visualization_for(&r).kind, ChartKind::Bar);
    }

    #[test]
    fn shares_suggest_pie() {
        let r = result(
            &["region", "pct"],
            vec![
                vec![json!("EU"), json!(40.0)],
                vec![json!("US"), json!(60.0)],
            ],
        );
        assert_eq!(visualization_for(&r).kind, ChartKind::Pie);
    }

    #[test]
    fn empty_result_is_a_table_with_narrative() {
        let r = result(&["a", "b"], Vec::new());
        let viz = visualization_for(&r);
        assert_eq!(viz.kind, ChartKind::Table);
        assert_eq!(viz.narrative, "The query returned no rows.");
    }

    #[test]
    fn data_quality_counts_nulls_and_duplicates() {
        let r = result(
            &["a", "b"],
            vec![
                vec![json!(1), json!(null)],
                vec![json!(1), json!(null)],
                vec![json!(2), json!("x")],
            ],
        );
        let quality = data_quality_for(&r);
        assert_eq!(quality.null_counts, vec![0, 2]);
        assert_eq!(quality.duplicate_rows, 1);
    }
}
