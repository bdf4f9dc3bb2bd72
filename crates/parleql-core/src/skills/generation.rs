//! Automatic skill generation from successful query patterns.
//!
//! Every successful execution is mined for a reusable pattern: which
//! business terms mapped to which expressions, which tables joined,
//! which aggregations recurred. Patterns accumulate in the KV store
//! under `skillgen:pattern:<kind>:<hash>`; once one recurs often enough
//! at high confidence it is promoted to a generated skill
//! (`skillgen:skill:<kind>:<hash>`) whose column mappings feed back into
//! the synthesizer as derived-column hints.

use std::sync::Arc;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::dialect::DatabaseKind;
use crate::kv::KvStore;
use crate::schema::DerivedHint;
use crate::validate::structure;

use super::{ColumnMapping, MappingKind};

/// Kinds of auto-generated skills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillKind {
    /// Business terms onto columns or expressions.
    ColumnMapping,
    /// A recurring overall query shape.
    QueryPattern,
    /// A recurring join path.
    TableJoin,
    /// A recurring aggregation.
    Aggregation,
    /// A recurring filter.
    Filter,
}

impl SkillKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ColumnMapping => "column_mapping",
            Self::QueryPattern => "query_pattern",
            Self::TableJoin => "table_join",
            Self::Aggregation => "aggregation",
            Self::Filter => "filter",
        }
    }
}

/// One business-term-to-expression pair captured from the skills output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedMapping {
    /// The user's word.
    pub concept: String,
    /// The expression it resolved to.
    pub expression: String,
    /// Table the expression draws from.
    pub table: String,
}

/// Pattern mined from one successful query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPattern {
    /// Classification.
    pub kind: SkillKind,
    /// Stable hash of the generalized SQL plus table set.
    pub hash: String,
    /// Human-readable description.
    pub description: String,
    /// Tables referenced, upper-cased and sorted.
    pub tables: Vec<String>,
    /// SQL with literals replaced by placeholders.
    pub sql_pattern: String,
    /// Concept/expression pairs from the skills engine.
    pub mappings: Vec<LearnedMapping>,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,
    /// The question that produced the pattern.
    pub example_query: String,
}

/// Aggregated pattern record as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternRecord {
    kind: SkillKind,
    hash: String,
    description: String,
    tables: Vec<String>,
    sql_pattern: String,
    mappings: Vec<LearnedMapping>,
    confidence: f32,
    frequency: u32,
    example_queries: Vec<String>,
}

/// A promoted, reusable skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSkill {
    /// Stable id, `sg_<kind>_<hash>`.
    pub skill_id: String,
    /// Classification.
    pub kind: SkillKind,
    /// Short name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Self-contained TOML definition (reviewable, exportable).
    pub definition: String,
    /// Questions the skill was distilled from.
    pub source_queries: Vec<String>,
    /// Confidence at promotion time.
    pub confidence: f32,
    /// Concept/expression pairs the synthesizer can reuse.
    pub mappings: Vec<LearnedMapping>,
    /// Promotion time.
    pub generated_at: DateTime<Utc>,
    /// Successful reuses over total reuses, 0 when never reused.
    pub effectiveness_score: f32,
    /// Times the skill was consulted.
    pub usage_count: u64,
}

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'[^']*'").expect("static regex"));
static NUMBER_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("static regex"));
static AGGREGATE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(SUM|AVG|COUNT|MIN|MAX)\s*\(").expect("static regex"));

/// Generalize SQL: literals become placeholders so two queries differing
/// only in constants share a pattern.
#[must_use]
pub fn generalize_sql(sql: &str) -> String {
    let replaced = STRING_LITERAL.replace_all(sql, ":s");
    let replaced = NUMBER_LITERAL.replace_all(&replaced, ":n");
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Mine a successful query for a pattern. Returns `None` when there is
/// nothing reusable (unparseable SQL, no tables).
#[must_use]
pub fn extract(
    user_query: &str,
    sql: &str,
    skills_mappings: &[ColumnMapping],
    dialect: DatabaseKind,
) -> Option<ExtractedPattern> {
    let report = structure::analyze(sql, dialect).ok()?;
    if report.tables.is_empty() {
        return None;
    }

    let sql_pattern = generalize_sql(sql);
    let upper = sql.to_ascii_uppercase();

    let mappings: Vec<LearnedMapping> = skills_mappings
        .iter()
        .filter(|m| m.kind != MappingKind::NotFound && !m.expression.is_empty())
        .map(|m| LearnedMapping {
            concept: m.concept.clone(),
            expression: m.expression.clone(),
            table: m.table.clone(),
        })
        .collect();

    let kind = if report.join_count > 0 {
        SkillKind::TableJoin
    } else if AGGREGATE_CALL.is_match(sql) {
        SkillKind::Aggregation
    } else if !mappings.is_empty() {
        SkillKind::ColumnMapping
    } else if upper.contains(" WHERE ") {
        SkillKind::Filter
    } else {
        SkillKind::QueryPattern
    };

    let mut tables = report.tables.clone();
    tables.sort();
    let hash = pattern_hash(&sql_pattern, &tables);

    // Mapped fraction of concepts raises confidence; an unmapped tail
    // lowers it.
    let mapped = mappings.len() as f32;
    let total = skills_mappings.len().max(1) as f32;
    let confidence = (0.6 + 0.3 * (mapped / total)).min(0.95);

    let description = match kind {
        SkillKind::TableJoin => format!("join pattern over {}", tables.join(", ")),
        SkillKind::Aggregation => format!("aggregation over {}", tables.join(", ")),
        SkillKind::ColumnMapping => format!(
            "column mappings for {}",
            mappings
                .iter()
                .map(|m| m.concept.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        SkillKind::Filter => format!("filter pattern over {}", tables.join(", ")),
        SkillKind::QueryPattern => format!("query pattern over {}", tables.join(", ")),
    };

    Some(ExtractedPattern {
        kind,
        hash,
        description,
        tables,
        sql_pattern,
        mappings,
        confidence,
        example_query: user_query.to_string(),
    })
}

fn pattern_hash(sql_pattern: &str, tables: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql_pattern.to_ascii_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(tables.join(",").as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Occurrences required before a pattern becomes a skill.
const MIN_FREQUENCY: u32 = 3;
/// Confidence required before a pattern becomes a skill.
const MIN_CONFIDENCE: f32 = 0.7;
/// Example questions kept per pattern.
const MAX_EXAMPLES: usize = 5;

/// KV-backed skill generator. All failures are logged and swallowed;
/// skill generation never fails a ticket.
pub struct SkillGenerator {
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl SkillGenerator {
    /// Create a generator over a KV store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    /// Record a mined pattern, bumping its frequency.
    pub async fn record(&self, pattern: &ExtractedPattern) {
        if !self.enabled {
            return;
        }
        let key = pattern_key(pattern.kind, &pattern.hash);
        let record = match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<PatternRecord>(&raw) {
                Ok(mut existing) => {
                    existing.frequency += 1;
                    existing.confidence = existing.confidence.max(pattern.confidence);
                    if !existing.example_queries.contains(&pattern.example_query)
                        && existing.example_queries.len() < MAX_EXAMPLES
                    {
                        existing.example_queries.push(pattern.example_query.clone());
                    }
                    existing
                }
                Err(_) => fresh_record(pattern),
            },
            Ok(None) => fresh_record(pattern),
            Err(e) => {
                warn!(error = %e, "pattern read failed; skill generation skipped");
                return;
            }
        };
        match serde_json::to_string(&record) {
            Ok(serialized) => {
                if let Err(e) = self.kv.set(&key, &serialized).await {
                    warn!(error = %e, "pattern write failed");
                }
            }
            Err(e) => warn!(error = %e, "pattern serialization failed"),
        }
    }

    /// Promote every pattern that has crossed the frequency and
    /// confidence thresholds and has no skill yet. Returns the newly
    /// generated skills.
    pub async fn promote_due(&self) -> Vec<GeneratedSkill> {
        if !self.enabled {
            return Vec::new();
        }
        let keys = match self.kv.scan_prefix("skillgen:pattern:").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "pattern scan failed");
                return Vec::new();
            }
        };
        let mut promoted = Vec::new();
        for key in keys {
            let Ok(Some(raw)) = self.kv.get(&key).await else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<PatternRecord>(&raw) else {
                continue;
            };
            if record.frequency < MIN_FREQUENCY || record.confidence < MIN_CONFIDENCE {
                continue;
            }
            let skill_key = skill_key(record.kind, &record.hash);
            if matches!(self.kv.get(&skill_key).await, Ok(Some(_))) {
                continue;
            }
            let skill = build_skill(&record);
            match serde_json::to_string(&skill) {
                Ok(serialized) => {
                    if let Err(e) = self.kv.set(&skill_key, &serialized).await {
                        warn!(error = %e, "skill write failed");
                        continue;
                    }
                    info!(skill_id = %skill.skill_id, kind = skill.kind.as_str(), "skill promoted");
                    promoted.push(skill);
                }
                Err(e) => warn!(error = %e, "skill serialization failed"),
            }
        }
        promoted
    }

    /// Column-mapping hints learned so far, as derived hints keyed by
    /// table. Merged into the prompt's schema view.
    pub async fn learned_hints(&self) -> Vec<(String, DerivedHint)> {
        if !self.enabled {
            return Vec::new();
        }
        let keys = match self.kv.scan_prefix("skillgen:skill:").await {
            Ok(keys) => keys,
            Err(_) => return Vec::new(),
        };
        let mut hints = Vec::new();
        for key in keys {
            let Ok(Some(raw)) = self.kv.get(&key).await else {
                continue;
            };
            let Ok(skill) = serde_json::from_str::<GeneratedSkill>(&raw) else {
                continue;
            };
            for mapping in &skill.mappings {
                if mapping.table.is_empty() {
                    continue;
                }
                hints.push((
                    mapping.table.clone(),
                    DerivedHint {
                        concept: mapping.concept.clone(),
                        expression: mapping.expression.clone(),
                        note: format!("learned from {} prior queries", skill.source_queries.len()),
                    },
                ));
            }
        }
        hints
    }

    /// Record whether a reused skill led to a successful execution.
    pub async fn track_effectiveness(&self, skill_id: &str, success: bool) {
        if !self.enabled {
            return;
        }
        let Some(key) = skill_key_from_id(skill_id) else {
            debug!(skill_id, "malformed skill id; effectiveness not tracked");
            return;
        };
        let Ok(Some(raw)) = self.kv.get(&key).await else {
            return;
        };
        let Ok(mut skill) = serde_json::from_str::<GeneratedSkill>(&raw) else {
            return;
        };
        let successes = skill.effectiveness_score * skill.usage_count as f32
            + if success { 1.0 } else { 0.0 };
        skill.usage_count += 1;
        skill.effectiveness_score = successes / skill.usage_count as f32;
        if let Ok(serialized) = serde_json::to_string(&skill) {
            let _ = self.kv.set(&key, &serialized).await;
        }
    }
}

fn fresh_record(pattern: &ExtractedPattern) -> PatternRecord {
    PatternRecord {
        kind: pattern.kind,
        hash: pattern.hash.clone(),
        description: pattern.description.clone(),
        tables: pattern.tables.clone(),
        sql_pattern: pattern.sql_pattern.clone(),
        mappings: pattern.mappings.clone(),
        confidence: pattern.confidence,
        frequency: 1,
        example_queries: vec![pattern.example_query.clone()],
    }
}

fn pattern_key(kind: SkillKind, hash: &str) -> String {
    format!("skillgen:pattern:{}:{hash}", kind.as_str())
}

fn skill_key(kind: SkillKind, hash: &str) -> String {
    format!("skillgen:skill:{}:{hash}", kind.as_str())
}

fn skill_key_from_id(skill_id: &str) -> Option<String> {
    let rest = skill_id.strip_prefix("sg_")?;
    let (kind, hash) = rest.rsplit_once('_')?;
    Some(format!("skillgen:skill:{kind}:{hash}"))
}

fn build_skill(record: &PatternRecord) -> GeneratedSkill {
    let name = format!("{}_{}", record.kind.as_str(), &record.hash[..8]);
    let mut definition = format!(
        "# Auto-generated skill\n\
         [skill]\n\
         name = \"{name}\"\n\
         kind = \"{}\"\n\
         description = \"{}\"\n\
         confidence = {:.2}\n\
         tables = [{}]\n\
         sql_pattern = \"{}\"\n",
        record.kind.as_str(),
        record.description.replace('"', "'"),
        record.confidence,
        record
            .tables
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", "),
        record.sql_pattern.replace('"', "'"),
    );
    for mapping in &record.mappings {
        definition.push_str(&format!(
            "\n[[skill.mappings]]\nconcept = \"{}\"\nexpression = \"{}\"\ntable = \"{}\"\n",
            mapping.concept.replace('"', "'"),
            mapping.expression.replace('"', "'"),
            mapping.table.replace('"', "'"),
        ));
    }
    GeneratedSkill {
        skill_id: format!("sg_{}_{}", record.kind.as_str(), record.hash),
        kind: record.kind,
        name,
        description: record.description.clone(),
        definition,
        source_queries: record.example_queries.clone(),
        confidence: record.confidence,
        mappings: record.mappings.clone(),
        generated_at: Utc::now(),
        effectiveness_score: 0.0,
        usage_count: 0,
    }
}
