//! Skills engine: business concepts onto physical schema.
//!
//! For every concept in the prompt the resolver walks a strict priority
//! chain (explicit user directive, exact column match, alias/fuzzy
//! match, derived temporal synthesis, numeric-metric heuristic,
//! aggregation heuristic) and produces mappings whose `expression` is
//! substitutable verbatim into SQL. When confidence is too low or a
//! concept is unmappable, the output carries a structured clarification
//! instead.

pub mod aliases;
pub mod clarifications;
pub mod generation;
pub mod implicit;

use serde::{Deserialize, Serialize};

use crate::dialect::{DatabaseKind, DatePart};
use crate::schema::{ColumnInfo, SchemaSnapshot};

pub use implicit::{ImplicitOps, OrderHint, SortDirection};

use aliases::{aliases_for, similarity, FUZZY_THRESHOLD};

/// How a concept was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingKind {
    /// Direct column from the schema.
    Physical,
    /// Computed expression (e.g. a quarter extractor).
    Derived,
    /// Aggregate function over a column.
    Aggregated,
    /// Concept could not be mapped.
    NotFound,
}

/// Result of resolving one business concept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// The user's word.
    pub concept: String,
    /// Resolution kind.
    pub kind: MappingKind,
    /// SQL fragment to paste directly. Empty for `NotFound`.
    pub expression: String,
    /// Table the expression draws from. Empty for `NotFound`.
    pub table: String,
    /// 0-100.
    pub confidence: u8,
    /// Human-readable provenance.
    pub note: String,
}

/// Structured clarification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationRequest {
    /// Question for the user.
    pub message: String,
    /// Tables the prompt appears to reference.
    pub referenced_tables: Vec<String>,
    /// Concepts that could not be mapped.
    pub unmapped_concepts: Vec<String>,
}

/// Skills engine output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsOutput {
    /// Per-concept mappings, in prompt order.
    pub mappings: Vec<ColumnMapping>,
    /// Penalized average confidence, 0-100.
    pub overall_confidence: u8,
    /// Present when the engine wants more information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationRequest>,
    /// Implicit grouping/sorting/limit hints.
    pub implicit_ops: ImplicitOps,
    /// False when a clarification is requested.
    pub ok: bool,
}

/// Clarification threshold on overall confidence.
const MIN_OVERALL_CONFIDENCE: u8 = 65;

/// Concepts the synthesizer can derive even without a mapping: temporal
/// parts and aggregation verbs.
const DERIVABLE: [&str; 11] = [
    "day", "daily", "month", "quarter", "year", "total", "sum", "average", "count", "max", "min",
];

/// Words that never become concepts.
const STOPWORDS: &[&str] = &[
    "show", "me", "the", "a", "an", "of", "in", "on", "at", "to", "for", "from", "by", "per",
    "each", "and", "or", "with", "what", "which", "who", "how", "many", "much", "is", "are",
    "was", "were", "please", "give", "list", "get", "find", "display", "all", "top", "highest",
    "lowest", "largest", "smallest", "most", "least", "last", "this", "that", "my", "our", "their",
    "use", "as", "calculate",
];

/// Aggregation verbs; excluded from concepts, carried as hints, and used
/// to upgrade adjacent metric mappings.
const AGG_VERBS: &[(&str, &str)] = &[
    ("total", "SUM"),
    ("sum", "SUM"),
    ("average", "AVG"),
    ("avg", "AVG"),
    ("count", "COUNT"),
    ("max", "MAX"),
    ("min", "MIN"),
];

/// Resolve the prompt's concepts against a schema snapshot.
#[must_use]
pub fn resolve(text: &str, schema: &SchemaSnapshot, dialect: DatabaseKind) -> SkillsOutput {
    let implicit_ops = implicit::infer(text);
    let directives = clarifications::parse(text);

    let mut candidate_tables = schema.tables_mentioned_in(text);
    let mentioned_explicitly = !candidate_tables.is_empty();
    if candidate_tables.is_empty() {
        candidate_tables = schema
            .all_relation_names()
            .into_iter()
            .map(ToString::to_string)
            .collect();
    }

    let concepts = extract_concepts(text, schema);
    let mut mappings: Vec<ColumnMapping> = Vec::new();

    for concept in &concepts {
        // Directives and exact matches are authoritative; below that, the
        // heuristics compete and the most confident one wins.
        let mapping = if let Some(directive) = directives.get(concept) {
            map_directive(concept, directive, &candidate_tables, schema, dialect)
        } else if let Some(exact) = map_exact(concept, &candidate_tables, schema, dialect) {
            exact
        } else {
            [
                map_partial(concept, &candidate_tables, schema, dialect),
                map_alias_fuzzy(concept, &candidate_tables, schema, dialect),
                map_derived_temporal(concept, &candidate_tables, schema, dialect),
                map_numeric_metric(concept, &candidate_tables, schema, dialect),
            ]
            .into_iter()
            .flatten()
            .max_by_key(|m| m.confidence)
            .unwrap_or_else(|| ColumnMapping {
                concept: concept.clone(),
                kind: MappingKind::NotFound,
                expression: String::new(),
                table: String::new(),
                confidence: 0,
                note: format!("no column matches '{concept}'"),
            })
        };
        mappings.push(mapping);
    }

    upgrade_aggregations(text, &mut mappings);

    let overall_confidence = overall_confidence(&mappings);
    let unmapped: Vec<String> = mappings
        .iter()
        .filter(|m| m.kind == MappingKind::NotFound)
        .map(|m| m.concept.clone())
        .collect();
    let hard_unmapped: Vec<&String> = unmapped
        .iter()
        .filter(|c| !DERIVABLE.contains(&c.as_str()))
        .collect();

    let needs_clarification =
        overall_confidence < MIN_OVERALL_CONFIDENCE || !hard_unmapped.is_empty();

    let clarification = needs_clarification.then(|| {
        let referenced_tables = if mentioned_explicitly {
            candidate_tables.clone()
        } else {
            primary_table(&mappings)
                .map(|t| vec![t])
                .unwrap_or_else(|| candidate_tables.iter().take(1).cloned().collect())
        };
        let columns_hint = referenced_tables
            .first()
            .and_then(|t| schema.columns_of(t))
            .map(|cols| {
                cols.iter()
                    .map(|c| c.name.clone())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default();
        let message = if unmapped.is_empty() {
            format!(
                "I'm not confident about the column mapping (confidence {overall_confidence}%). \
                 Could you name the columns to use? Available: {columns_hint}"
            )
        } else {
            format!(
                "I couldn't map {} to any column. Available columns in {}: {}. \
                 You can answer like 'use SOME_COLUMN for {}'.",
                unmapped
                    .iter()
                    .map(|c| format!("'{c}'"))
                    .collect::<Vec<_>>()
                    .join(", "),
                referenced_tables.first().map_or("the schema", String::as_str),
                columns_hint,
                unmapped.first().map_or("it", String::as_str),
            )
        };
        ClarificationRequest {
            message,
            referenced_tables,
            unmapped_concepts: unmapped.clone(),
        }
    });

    SkillsOutput {
        ok: clarification.is_none(),
        mappings,
        overall_confidence,
        clarification,
        implicit_ops,
    }
}

/// Extract candidate concepts from the prompt, in order, deduplicated.
fn extract_concepts(text: &str, schema: &SchemaSnapshot) -> Vec<String> {
    let lowered = text.to_ascii_lowercase();
    let table_names: Vec<String> = schema
        .all_relation_names()
        .into_iter()
        .map(str::to_ascii_lowercase)
        .collect();
    let mut out: Vec<String> = Vec::new();
    for word in lowered.split(|c: char| !c.is_ascii_alphanumeric() && c != '_') {
        if word.len() < 3 || word.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let normalized = normalize_concept(word);
        if STOPWORDS.contains(&normalized.as_str())
            || AGG_VERBS.iter().any(|(v, _)| *v == normalized)
            || crate::sentiment::is_sentiment_word(&normalized)
            || table_names.iter().any(|t| {
                t == &normalized || t.strip_suffix('s').unwrap_or(t) == normalized
            })
            || out.contains(&normalized)
        {
            continue;
        }
        out.push(normalized);
    }
    out
}

/// Fold temporal adjectives onto their date part.
fn normalize_concept(word: &str) -> String {
    match word {
        "quarterly" => "quarter".to_string(),
        "monthly" => "month".to_string(),
        "yearly" | "annual" | "annually" => "year".to_string(),
        "weekly" => "week".to_string(),
        other => other.to_string(),
    }
}

/// Table-qualified, dialect-quoted reference to a column.
fn qualified(table: &str, column: &ColumnInfo, dialect: DatabaseKind) -> String {
    let col = if column.requires_quoting {
        dialect.quote_identifier(&column.name)
    } else {
        column.name.clone()
    };
    format!("{table}.{col}")
}

fn map_directive(
    concept: &str,
    directive: &clarifications::Directive,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> ColumnMapping {
    if directive.is_expression {
        return ColumnMapping {
            concept: concept.to_string(),
            kind: MappingKind::Derived,
            expression: directive.target.clone(),
            table: candidate_tables.first().cloned().unwrap_or_default(),
            confidence: 100,
            note: "user-supplied expression".to_string(),
        };
    }
    // Bare identifier: resolve to its table to qualify the reference.
    for table in candidate_tables {
        if let Some(columns) = schema.columns_of(table) {
            if let Some(column) = columns
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(&directive.target))
            {
                return ColumnMapping {
                    concept: concept.to_string(),
                    kind: MappingKind::Physical,
                    expression: qualified(table, column, dialect),
                    table: table.clone(),
                    confidence: 100,
                    note: "user-directed column".to_string(),
                };
            }
        }
    }
    // Directive names a column the schema doesn't have; trust the user
    // but say so.
    ColumnMapping {
        concept: concept.to_string(),
        kind: MappingKind::Physical,
        expression: directive.target.clone(),
        table: candidate_tables.first().cloned().unwrap_or_default(),
        confidence: 100,
        note: "user-directed column (not verified against schema)".to_string(),
    }
}

fn map_exact(
    concept: &str,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> Option<ColumnMapping> {
    for table in candidate_tables {
        let Some(columns) = schema.columns_of(table) else {
            continue;
        };
        if let Some(column) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(concept)) {
            return Some(ColumnMapping {
                concept: concept.to_string(),
                kind: MappingKind::Physical,
                expression: qualified(table, column, dialect),
                table: table.clone(),
                confidence: 90,
                note: "exact column match".to_string(),
            });
        }
    }
    None
}

fn map_partial(
    concept: &str,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> Option<ColumnMapping> {
    let needle = concept.to_ascii_lowercase();
    for table in candidate_tables {
        let Some(columns) = schema.columns_of(table) else {
            continue;
        };
        if let Some(column) = columns
            .iter()
            .find(|c| c.name.to_ascii_lowercase().contains(&needle))
        {
            return Some(ColumnMapping {
                concept: concept.to_string(),
                kind: MappingKind::Physical,
                expression: qualified(table, column, dialect),
                table: table.clone(),
                confidence: 40,
                note: format!("partial match on {}", column.name),
            });
        }
    }
    None
}

fn map_alias_fuzzy(
    concept: &str,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> Option<ColumnMapping> {
    let aliases = aliases_for(concept);
    let mut best: Option<(f64, String, ColumnInfo)> = None;
    for table in candidate_tables {
        let Some(columns) = schema.columns_of(table) else {
            continue;
        };
        for column in columns {
            let name_upper = column.name.to_ascii_uppercase();
            let score = aliases
                .iter()
                .map(|alias| {
                    if name_upper.contains(&alias.to_ascii_uppercase()) {
                        similarity(alias, &name_upper).max(FUZZY_THRESHOLD)
                    } else {
                        similarity(alias, &name_upper)
                    }
                })
                .fold(0.0_f64, f64::max);
            if score >= FUZZY_THRESHOLD
                && best.as_ref().is_none_or(|(s, _, _)| score > *s)
            {
                best = Some((score, table.clone(), column.clone()));
            }
        }
    }
    best.map(|(score, table, column)| {
        let confidence = (60.0 + (score - FUZZY_THRESHOLD) * 40.0).round();
        ColumnMapping {
            concept: concept.to_string(),
            kind: MappingKind::Physical,
            expression: qualified(&table, &column, dialect),
            confidence: (confidence as u8).min(92),
            note: format!("semantic alias/fuzzy match on {}", column.name),
            table,
        }
    })
}

fn map_derived_temporal(
    concept: &str,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> Option<ColumnMapping> {
    let part = match concept {
        "day" | "daily" => DatePart::Day,
        "month" => DatePart::Month,
        "quarter" => DatePart::Quarter,
        "year" => DatePart::Year,
        _ => return None,
    };
    for table in candidate_tables {
        let Some(columns) = schema.columns_of(table) else {
            continue;
        };
        let Some(date_column) = best_date_column(columns) else {
            continue;
        };
        let source = qualified(table, date_column, dialect);
        return Some(ColumnMapping {
            concept: concept.to_string(),
            kind: MappingKind::Derived,
            expression: dialect.date_part_expr(part, &source),
            table: table.clone(),
            confidence: 95,
            note: format!("derived {concept} from {}", date_column.name),
        });
    }
    None
}

/// Rank date columns by name token, then fall back to the first
/// DATE/TIMESTAMP-typed column.
fn best_date_column(columns: &[ColumnInfo]) -> Option<&ColumnInfo> {
    const NAME_PRIORITY: [&str; 5] = ["DATE", "EVENT_DATE", "TIMESTAMP", "DT", "TS"];
    let mut best: Option<(usize, &ColumnInfo)> = None;
    for column in columns {
        let name = column.name.to_ascii_uppercase();
        let rank = NAME_PRIORITY
            .iter()
            .enumerate()
            .filter(|(_, token)| name.contains(**token))
            .map(|(i, _)| NAME_PRIORITY.len() - i)
            .max();
        if let Some(rank) = rank {
            if best.is_none_or(|(r, _)| rank > r) {
                best = Some((rank, column));
            }
        }
    }
    best.map(|(_, c)| c)
        .or_else(|| columns.iter().find(|c| c.is_temporal()))
}

fn map_numeric_metric(
    concept: &str,
    candidate_tables: &[String],
    schema: &SchemaSnapshot,
    dialect: DatabaseKind,
) -> Option<ColumnMapping> {
    let needle = concept.to_ascii_uppercase();
    for table in candidate_tables {
        let Some(columns) = schema.columns_of(table) else {
            continue;
        };
        for column in columns {
            if column.is_numeric() && column.name.to_ascii_uppercase().contains(&needle) {
                return Some(ColumnMapping {
                    concept: concept.to_string(),
                    kind: MappingKind::Physical,
                    expression: qualified(table, column, dialect),
                    table: table.clone(),
                    confidence: 85,
                    note: format!("numeric metric column {}", column.name),
                });
            }
        }
    }
    None
}

/// Upgrade a metric mapping to an aggregate when an aggregation verb
/// immediately precedes the concept in the prompt ("total sales").
fn upgrade_aggregations(text: &str, mappings: &mut [ColumnMapping]) {
    let lowered = text.to_ascii_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .collect();
    for mapping in mappings.iter_mut() {
        if mapping.kind != MappingKind::Physical || mapping.confidence < 40 {
            continue;
        }
        let Some(pos) = words.iter().position(|w| {
            normalize_concept(w) == mapping.concept
        }) else {
            continue;
        };
        if pos == 0 {
            continue;
        }
        if let Some((_, func)) = AGG_VERBS.iter().find(|(v, _)| *v == words[pos - 1]) {
            mapping.kind = MappingKind::Aggregated;
            mapping.expression = format!("{func}({})", mapping.expression);
            mapping.note = format!("{} ({})", mapping.note, func.to_ascii_lowercase());
        }
    }
}

/// Penalized average confidence across mappings.
fn overall_confidence(mappings: &[ColumnMapping]) -> u8 {
    let mapped: Vec<&ColumnMapping> = mappings
        .iter()
        .filter(|m| m.kind != MappingKind::NotFound)
        .collect();
    if mapped.is_empty() {
        return 0;
    }
    let base: u32 =
        mapped.iter().map(|m| u32::from(m.confidence)).sum::<u32>() / mapped.len() as u32;

    let mut penalty: u32 = 0;
    let distinct_tables: std::collections::HashSet<&str> = mapped
        .iter()
        .map(|m| m.table.as_str())
        .filter(|t| !t.is_empty())
        .collect();
    if distinct_tables.len() >= 2 {
        penalty += 50;
    }
    let unmapped = mappings.len() - mapped.len();
    penalty += 20 * unmapped as u32;
    penalty += 10 * mapped.iter().filter(|m| m.confidence < 80).count() as u32;

    u8::try_from(base.saturating_sub(penalty)).unwrap_or(0)
}

/// The table most mappings draw from.
fn primary_table(mappings: &[ColumnMapping]) -> Option<String> {
    let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for m in mappings {
        if !m.table.is_empty() {
            *counts.entry(m.table.as_str()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(t, _)| t.to_string())
}
