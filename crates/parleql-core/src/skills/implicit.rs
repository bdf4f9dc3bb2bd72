//! Implicit-operation inference.
//!
//! Scans the prompt for grouping, sorting, and limiting cues the user
//! implied rather than stated. The synthesizer folds these into the
//! prompt as hints; nothing here is binding.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Sort direction hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Highest first.
    Desc,
    /// Lowest first.
    Asc,
}

/// One ordering cue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderHint {
    /// Concept to order by, when the phrasing names one.
    pub concept: Option<String>,
    /// Direction.
    pub direction: SortDirection,
}

/// Inferred implicit operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImplicitOps {
    /// Concepts the user wants grouping by.
    pub group_by_hints: Vec<String>,
    /// Ordering cues.
    pub order_by_hints: Vec<OrderHint>,
    /// Explicit row limit ("top 5").
    pub limit_hint: Option<u64>,
    /// Aggregation verbs present in the prompt.
    pub aggregation_hints: Vec<String>,
}

static GROUP_CUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:by|per|for\s+each)\s+([a-z_][a-z0-9_]*)").expect("static regex")
});
static TOP_N: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\btop\s+(\d+)\b").expect("static regex"));
static HIGHEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(highest|largest|biggest|most|top)\b").expect("static regex")
});
static LOWEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(lowest|smallest|least|bottom)\b").expect("static regex")
});
static AGGREGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(total|sum|average|avg|count|how\s+many|max(?:imum)?|min(?:imum)?)\b")
        .expect("static regex")
});

/// Words a grouping cue should never capture ("by year" is real,
/// "by the" is noise).
const GROUP_STOPWORDS: [&str; 6] = ["the", "a", "an", "each", "all", "every"];

/// Infer implicit operations from the prompt.
#[must_use]
pub fn infer(text: &str) -> ImplicitOps {
    let mut ops = ImplicitOps::default();

    for caps in GROUP_CUE.captures_iter(text) {
        let concept = caps[1].to_ascii_lowercase();
        if !GROUP_STOPWORDS.contains(&concept.as_str()) && !ops.group_by_hints.contains(&concept) {
            ops.group_by_hints.push(concept);
        }
    }

    if let Some(caps) = TOP_N.captures(text) {
        ops.limit_hint = caps[1].parse().ok();
    }

    if HIGHEST.is_match(text) {
        ops.order_by_hints.push(OrderHint {
            concept: None,
            direction: SortDirection::Desc,
        });
    } else if LOWEST.is_match(text) {
        ops.order_by_hints.push(OrderHint {
            concept: None,
            direction: SortDirection::Asc,
        });
    }

    for caps in AGGREGATION.captures_iter(text) {
        let verb = caps[1].to_ascii_lowercase();
        let canonical = match verb.as_str() {
            "avg" => "average".to_string(),
            "how many" => "count".to_string(),
            "maximum" => "max".to_string(),
            "minimum" => "min".to_string(),
            other => other.to_string(),
        };
        if !ops.aggregation_hints.contains(&canonical) {
            ops.aggregation_hints.push(canonical);
        }
    }

    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grouping_and_aggregation_cues() {
        let ops = infer("total sales by region for 2024");
        assert_eq!(ops.group_by_hints, vec!["region".to_string()]);
        assert_eq!(ops.aggregation_hints, vec!["total".to_string()]);
        assert!(ops.limit_hint.is_none());
    }

    #[test]
    fn top_n_sets_limit_and_direction() {
        let ops = infer("top 5 customers by revenue");
        assert_eq!(ops.limit_hint, Some(5));
        assert!(matches!(
            ops.order_by_hints.first(),
            Some(OrderHint {
                direction: SortDirection::Desc,
                ..
            })
        ));
    }

    #[test]
    fn lowest_sorts_ascending() {
        let ops = infer("which region had the lowest churn");
        assert!(matches!(
            ops.order_by_hints.first(),
            Some(OrderHint {
                direction: SortDirection::Asc,
                ..
            })
        ));
    }

    #[test]
    fn stopwords_are_not_group_keys() {
        let ops = infer("orders by the warehouse");
        assert_eq!(ops.group_by_hints, vec!["warehouse".to_string()]);
    }
}
