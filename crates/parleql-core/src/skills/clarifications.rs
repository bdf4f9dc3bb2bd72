//! Parsing explicit user directives out of the prompt.
//!
//! When a user answers a clarification (or preempts one), the directive
//! wins over every heuristic:
//!
//! - `use NR_SBSC as the subscriber` / `use DATE for quarter`
//! - `sector = SECTOR`
//! - `volume = UL_GOODPUT_MB + DL_GOODPUT_MB`
//! - `calculate growth as (current - previous) / previous`

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

/// A parsed directive: the concept and the column or expression to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Column name or SQL expression.
    pub target: String,
    /// Whether the target is an arithmetic expression rather than a bare
    /// identifier.
    pub is_expression: bool,
}

static USE_AS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\buse\s+(\w+)\s+(?:as\s+(?:the\s+)?|for\s+)(\w+)").expect("static regex")
});
static ASSIGN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\w+)\s*=\s*([A-Za-z_][\w]*(?:\s*[-+*/]\s*[A-Za-z_][\w]*)*)")
        .expect("static regex")
});
static CALCULATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bcalculate\s+(\w+)\s+as\s+(\([^)]+\)[^,.;]*|[^,.;]+)").expect("static regex")
});

/// Extract directives, keyed by lower-cased concept.
///
/// Later patterns do not overwrite earlier ones: `use X as Y` is the most
/// deliberate phrasing and wins over a bare `=` elsewhere in the text.
#[must_use]
pub fn parse(text: &str) -> HashMap<String, Directive> {
    let mut out: HashMap<String, Directive> = HashMap::new();

    for caps in USE_AS.captures_iter(text) {
        let target = caps[1].to_string();
        let concept = caps[2].to_ascii_lowercase();
        out.entry(concept).or_insert(Directive {
            target,
            is_expression: false,
        });
    }

    for caps in CALCULATE.captures_iter(text) {
        let concept = caps[1].to_ascii_lowercase();
        let target = caps[2].trim().to_string();
        out.entry(concept).or_insert(Directive {
            target,
            is_expression: true,
        });
    }

    for caps in ASSIGN.captures_iter(text) {
        let concept = caps[1].to_ascii_lowercase();
        let target = caps[2].trim().to_string();
        let is_expression = target.contains(['+', '-', '*', '/']);
        out.entry(concept).or_insert(Directive {
            target,
            is_expression,
        });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn use_as_and_use_for() {
        let d = parse("Use NR_SBSC as the subscriber and use DATE for quarter");
        assert_eq!(d["subscriber"].target, "NR_SBSC");
        assert!(!d["subscriber"].is_expression);
        assert_eq!(d["quarter"].target, "DATE");
    }

    #[test]
    fn assignment_with_arithmetic_is_an_expression() {
        let d = parse("volume = UL_GOODPUT_MB + DL_GOODPUT_MB");
        assert_eq!(d["volume"].target, "UL_GOODPUT_MB + DL_GOODPUT_MB");
        assert!(d["volume"].is_expression);
    }

    #[test]
    fn simple_assignment_is_physical() {
        let d = parse("sector = SECTOR");
        assert_eq!(d["sector"].target, "SECTOR");
        assert!(!d["sector"].is_expression);
    }

    #[test]
    fn calculate_as() {
        let d = parse("calculate growth as (current - previous) / previous");
        assert!(d["growth"].is_expression);
        assert!(d["growth"].target.starts_with('('));
    }

    #[test]
    fn use_as_wins_over_assignment() {
        let d = parse("use REGION_CODE for region; region = REGION_NAME");
        assert_eq!(d["region"].target, "REGION_CODE");
    }
}
