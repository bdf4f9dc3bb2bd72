//! Structured prompt composition for SQL generation.
//!
//! The prompt is assembled section by section in a fixed order; the
//! mapping block and the mandatory schema constraints are the
//! load-bearing parts, everything else is context. Output rules pin the
//! completion format: SQL only, a trailing `-- CONFIDENCE: N%` line, and
//! `-- ERROR:` as the one escape hatch for asking a clarification.

use std::fmt::Write as _;

use crate::dialect::DatabaseKind;
use crate::llm::LlmMessage;
use crate::skills::{MappingKind, SkillsOutput, SortDirection};
use crate::schema::SchemaSnapshot;
use crate::types::ChatTurn;

/// Marker the model must emit when it needs a clarification.
pub const ERROR_MARKER: &str = "-- ERROR:";
/// Marker carrying the model's self-reported confidence.
pub const CONFIDENCE_MARKER: &str = "-- CONFIDENCE:";

/// Per-call context for the prompt builder.
pub struct PromptContext<'a> {
    /// The user's question.
    pub user_text: &'a str,
    /// Router-normalized restatement, when available.
    pub enhanced_intent: Option<&'a str>,
    /// Skills output: mappings and implicit ops.
    pub skills: &'a SkillsOutput,
    /// Schema snapshot.
    pub schema: &'a SchemaSnapshot,
    /// Target dialect.
    pub dialect: DatabaseKind,
    /// Prior conversation turns.
    pub history: &'a [ChatTurn],
    /// Up to three similar past successful queries, `(question, sql)`.
    pub similar_queries: &'a [(String, String)],
    /// Scope constraints to state (role limits), already rendered.
    pub scope_constraints: &'a [String],
}

/// Build the generation prompt.
#[must_use]
pub fn build(ctx: &PromptContext<'_>) -> Vec<LlmMessage> {
    let mut messages = Vec::with_capacity(ctx.history.len() + 2);

    // (a) Dialect header with a hard rule against other dialects.
    let system = format!(
        "You are a SQL generator for {dialect}. Emit {dialect} syntax ONLY; never use \
         constructs from other dialects. Row limiting uses `{limit}`.\n\
         Output rules:\n\
         - Return SQL only. No code fences, no explanations, no prose.\n\
         - End with a final line `{confidence} N%` stating your confidence.\n\
         - If a required concept cannot be resolved, return ONLY a comment block starting \
         with `{error}` describing what is missing.",
        dialect = ctx.dialect,
        limit = ctx.dialect.limit_clause(1000),
        confidence = CONFIDENCE_MARKER,
        error = ERROR_MARKER,
    );
    messages.push(LlmMessage::system(system));

    for turn in ctx.history {
        match turn.role {
            crate::types::ChatRole::User => messages.push(LlmMessage::user(turn.content.clone())),
            crate::types::ChatRole::Assistant => {
                messages.push(LlmMessage::assistant(turn.content.clone()));
            }
        }
    }

    let mut body = String::new();

    // (b) Validated column mappings.
    let _ = writeln!(body, "## Validated column mappings");
    for mapping in &ctx.skills.mappings {
        if mapping.kind == MappingKind::NotFound {
            continue;
        }
        let _ = writeln!(
            body,
            "- \"{}\" -> {} [{}] ({})",
            mapping.concept,
            mapping.expression,
            kind_label(mapping.kind),
            mapping.note
        );
    }

    // (c) Mentioned tables in full, with quoting constraints.
    let referenced: Vec<&str> = referenced_tables(ctx);
    let _ = writeln!(body, "\n## Mandatory schema constraints");
    let _ = writeln!(
        body,
        "Use EXACTLY these column names; a name tagged [REQUIRES QUOTES] must be quoted."
    );
    for table in &referenced {
        if let Some(columns) = ctx.schema.columns_of(table) {
            let _ = writeln!(body, "Table {table}:");
            for column in columns {
                let _ = writeln!(
                    body,
                    "  - {} {}{}",
                    column.name,
                    column.data_type,
                    if column.requires_quoting {
                        " [REQUIRES QUOTES]"
                    } else {
                        ""
                    }
                );
            }
        }
    }

    // (d) Compact full-schema reference.
    let _ = writeln!(body, "\n## Schema reference");
    for name in ctx.schema.all_relation_names() {
        if let Some(columns) = ctx.schema.columns_of(name) {
            let cols: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            let _ = writeln!(body, "- {name}({})", cols.join(", "));
        }
    }

    // (e) Implicit-operation hints.
    let ops = &ctx.skills.implicit_ops;
    if !ops.group_by_hints.is_empty()
        || !ops.order_by_hints.is_empty()
        || ops.limit_hint.is_some()
        || !ops.aggregation_hints.is_empty()
    {
        let _ = writeln!(body, "\n## Implied operations");
        if !ops.group_by_hints.is_empty() {
            let _ = writeln!(body, "- group by: {}", ops.group_by_hints.join(", "));
        }
        for hint in &ops.order_by_hints {
            let direction = match hint.direction {
                SortDirection::Desc => "descending",
                SortDirection::Asc => "ascending",
            };
            let _ = writeln!(
                body,
                "- order: {}{}",
                direction,
                hint.concept
                    .as_deref()
                    .map(|c| format!(" by {c}"))
                    .unwrap_or_default()
            );
        }
        if let Some(limit) = ops.limit_hint {
            let _ = writeln!(body, "- limit: {limit}");
        }
        if !ops.aggregation_hints.is_empty() {
            let _ = writeln!(body, "- aggregations: {}", ops.aggregation_hints.join(", "));
        }
    }

    // (f) Sample rows, two per referenced table.
    let mut wrote_samples_header = false;
    for table in &referenced {
        if let Some(rows) = ctx.schema.samples.get(*table) {
            if rows.is_empty() {
                continue;
            }
            if !wrote_samples_header {
                let _ = writeln!(body, "\n## Sample data");
                wrote_samples_header = true;
            }
            let _ = writeln!(body, "{table}:");
            for row in rows.iter().take(2) {
                let _ = writeln!(
                    body,
                    "  {}",
                    serde_json::to_string(row).unwrap_or_else(|_| "[]".to_string())
                );
            }
        }
    }

    // (g) Relationships and join paths.
    if !ctx.schema.relationships.is_empty() {
        let _ = writeln!(body, "\n## Relationships (ranked join paths)");
        for rel in &ctx.schema.relationships {
            let _ = writeln!(
                body,
                "- {}.{} -> {}.{}",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            );
        }
    }

    // (h) Derived-column hints.
    let mut wrote_derived_header = false;
    for table in &referenced {
        if let Some(hints) = ctx.schema.derived_hints.get(*table) {
            if !wrote_derived_header {
                let _ = writeln!(body, "\n## Derived-column hints");
                wrote_derived_header = true;
            }
            for hint in hints {
                let _ = writeln!(
                    body,
                    "- {} ({}): {}",
                    hint.concept, hint.note, hint.expression
                );
            }
        }
    }

    // (i) Similar past queries (at most three).
    if !ctx.similar_queries.is_empty() {
        let _ = writeln!(body, "\n## Similar past queries");
        for (question, sql) in ctx.similar_queries.iter().take(3) {
            let _ = writeln!(body, "Q: {question}\nSQL: {sql}");
        }
    }

    // (j) Metric library rides in via derived hints; (k) scope constraints.
    if !ctx.scope_constraints.is_empty() {
        let _ = writeln!(body, "\n## Scope constraints");
        for constraint in ctx.scope_constraints {
            let _ = writeln!(body, "- {constraint}");
        }
    }

    // The question itself, last.
    let _ = writeln!(body, "\n## Question");
    let _ = writeln!(body, "{}", ctx.enhanced_intent.unwrap_or(ctx.user_text));

    messages.push(LlmMessage::user(body));
    messages
}

fn kind_label(kind: MappingKind) -> &'static str {
    match kind {
        MappingKind::Physical => "physical",
        MappingKind::Derived => "derived",
        MappingKind::Aggregated => "aggregated",
        MappingKind::NotFound => "not_found",
    }
}

/// Tables referenced by the mappings, falling back to tables mentioned in
/// the prompt.
fn referenced_tables<'a>(ctx: &'a PromptContext<'_>) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::new();
    for mapping in &ctx.skills.mappings {
        if !mapping.table.is_empty() && !out.contains(&mapping.table.as_str()) {
            out.push(mapping.table.as_str());
        }
    }
    if out.is_empty() {
        for name in ctx.schema.all_relation_names() {
            out.push(name);
            if out.len() >= 3 {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::DatabaseKind;
    use crate::schema::ColumnInfo;
    use crate::skills;
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
            ],
        );
        SchemaSnapshot {
            tables,
            ..SchemaSnapshot::default()
        }
    }

    #[test]
    fn prompt_sections_are_ordered() {
        let snapshot = schema();
        let skills_out = skills::resolve("total sales by region", &snapshot, DatabaseKind::Oracle);
        let messages = build(&PromptContext {
            user_text: "total sales by region",
            enhanced_intent: None,
            skills: &skills_out,
            schema: &snapshot,
            dialect: DatabaseKind::Oracle,
            history: &[],
            similar_queries: &[],
            scope_constraints: &["at most 4 tables".to_string()],
        });
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.contains("FETCH FIRST 1000 ROWS ONLY"));
        assert!(messages[0].content.contains("-- CONFIDENCE:"));
        let body = &messages[1].content;
        let mappings_at = body.find("## Validated column mappings").expect("mappings");
        let constraints_at = body.find("## Mandatory schema constraints").expect("constraints");
        let reference_at = body.find("## Schema reference").expect("reference");
        let question_at = body.find("## Question").expect("question");
        assert!(mappings_at < constraints_at);
        assert!(constraints_at < reference_at);
        assert!(reference_at < question_at);
        assert!(body.contains("[REQUIRES QUOTES]"));
        assert!(body.contains("at most 4 tables"));
    }
}
