//! Business-vocabulary alias tables and fuzzy matching.
//!
//! The tables are deliberately domain-agnostic: abbreviations cover how
//! warehouse columns are habitually named (DT, QTR, AMT, ...); synonyms
//! cover how people talk about them.

/// Common column-name abbreviations, keyed by the business word.
pub const ABBREVIATIONS: &[(&str, &[&str])] = &[
    ("date", &["DATE", "DT", "TIME", "TIMESTAMP", "TS"]),
    ("month", &["MONTH", "MON", "MM", "MTH"]),
    ("year", &["YEAR", "YR", "YYYY"]),
    ("quarter", &["QUARTER", "QTR", "Q"]),
    ("id", &["ID", "IDENT", "IDENTIFIER", "KEY"]),
    ("name", &["NAME", "NM", "LABEL", "TITLE"]),
    ("number", &["NUMBER", "NUM", "NR", "NO"]),
    ("count", &["COUNT", "CNT", "NR"]),
    ("average", &["AVERAGE", "AVG", "MEAN"]),
    ("total", &["TOTAL", "TOT", "SUM"]),
    ("amount", &["AMOUNT", "AMT"]),
    ("value", &["VALUE", "VAL"]),
    ("type", &["TYPE", "TYP"]),
    ("status", &["STATUS", "STAT", "STS"]),
    ("description", &["DESCRIPTION", "DESC", "DESCR"]),
];

/// Semantic synonyms, keyed by the business word.
pub const SYNONYMS: &[(&str, &[&str])] = &[
    ("date", &["date", "timestamp", "time"]),
    ("quarter", &["quarter", "qtr", "q"]),
    ("month", &["month", "mon", "mm"]),
    ("year", &["year", "yyyy", "yr"]),
    ("customer", &["customer", "client", "user"]),
    ("amount", &["amount", "value", "total"]),
];

/// Minimum similarity ratio for a fuzzy column match.
pub const FUZZY_THRESHOLD: f64 = 0.78;

/// Expand a concept into every alias worth trying against column names.
///
/// The concept itself, its synonyms, and any abbreviation family it
/// belongs to (as key or member), all in both cases.
#[must_use]
pub fn aliases_for(concept: &str) -> Vec<String> {
    let base = concept.to_ascii_lowercase();
    let mut out: Vec<String> = vec![base.clone(), base.to_ascii_uppercase()];
    let mut push = |s: &str| {
        for candidate in [s.to_ascii_lowercase(), s.to_ascii_uppercase()] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    };
    for (key, syns) in SYNONYMS {
        if *key == base {
            for s in *syns {
                push(s);
            }
        }
    }
    for (key, abbrs) in ABBREVIATIONS {
        let member = abbrs.iter().any(|a| a.eq_ignore_ascii_case(&base));
        if *key == base || member {
            push(key);
            for a in *abbrs {
                push(a);
            }
        }
    }
    out
}

/// Character similarity ratio in [0, 1]: `2 * LCS / (|a| + |b|)`,
/// case-insensitive. 1.0 means identical.
#[must_use]
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.to_ascii_uppercase().chars().collect();
    let b: Vec<char> = b.to_ascii_uppercase().chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    // Longest common subsequence, two-row DP.
    let mut prev = vec![0_usize; b.len() + 1];
    let mut curr = vec![0_usize; b.len() + 1];
    for ca in &a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    let lcs = prev[b.len()];
    (2.0 * lcs as f64) / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_expand_both_directions() {
        let aliases = aliases_for("quarter");
        assert!(aliases.contains(&"QTR".to_string()));
        assert!(aliases.contains(&"Q".to_string()));
        // Membership lookup: "qtr" expands back to "quarter".
        let reverse = aliases_for("qtr");
        assert!(reverse.contains(&"quarter".to_string()));
    }

    #[test]
    fn similarity_bounds() {
        assert!((similarity("revenue", "REVENUE") - 1.0).abs() < f64::EPSILON);
        assert!(similarity("revenue", "REVENUE_USD") >= FUZZY_THRESHOLD);
        assert!(similarity("cohort", "SALES_AMOUNT") < FUZZY_THRESHOLD);
        assert!((similarity("", "x") - 0.0).abs() < f64::EPSILON);
    }
}
