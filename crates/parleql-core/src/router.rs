//! Intent routing.
//!
//! Classifies user input into conversational / metadata / data-query /
//! ambiguous before any LLM money is spent. Pattern matching is
//! authoritative; the LLM fallback only runs when explicitly enabled and
//! the patterns are inconclusive, and its failure silently degrades back
//! to the pattern result.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::llm::{LlmMessage, LlmOptions, LlmProvider};
use crate::schema::SchemaSnapshot;
use crate::types::ChatTurn;

/// Classified intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Small talk; answered with a canned reply.
    Conversational,
    /// Question about the schema itself.
    MetadataQuery,
    /// A question that needs SQL.
    DataQuery,
    /// Cannot tell; ask the user to rephrase.
    Ambiguous,
}

/// Router output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Classified intent.
    pub intent: Intent,
    /// Whether the pipeline should generate SQL.
    pub requires_sql: bool,
    /// Reply to short-circuit with, for non-data intents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canned_reply: Option<String>,
    /// Normalized restatement for downstream prompting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_intent: Option<String>,
    /// Classifier confidence in [0, 1].
    pub confidence: f32,
}

static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|good\s+(morning|afternoon|evening)|howdy)\b").expect("static regex")
});
static THANKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(thanks|thank\s+you|appreciate)\b").expect("static regex"));
static IDENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(who\s+are\s+you|what\s+are\s+you|what\s+can\s+you\s+do|help)\b")
        .expect("static regex")
});
static METADATA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(what|which|list|show)\s+(tables?|views?|columns?|schemas?)\b|\bdescribe\s+\w+|\bwhat\s+data\s+do\s+you\s+have\b",
    )
    .expect("static regex")
});
static DATA_VERB: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(show|list|give|get|find|display|total|sum|count|average|avg|max|min|top|compare|trend|breakdown|how\s+many|how\s+much)\b",
    )
    .expect("static regex")
});

/// Classifies input; stateless apart from compiled patterns.
pub struct IntentRouter {
    llm_fallback: bool,
}

impl IntentRouter {
    /// Create a router; `llm_fallback` gates the LLM tie-breaker.
    #[must_use]
    pub const fn new(llm_fallback: bool) -> Self {
        Self { llm_fallback }
    }

    /// Classify user input.
    ///
    /// Never fails: an unusable LLM fallback degrades to the pattern
    /// result, and anything unrecognized classifies as ambiguous.
    pub async fn classify(
        &self,
        llm: &dyn LlmProvider,
        text: &str,
        _history: &[ChatTurn],
        schema: Option<&SchemaSnapshot>,
        cancel: &CancellationToken,
    ) -> RoutingDecision {
        let trimmed = text.trim();

        if GREETING.is_match(trimmed) || THANKS.is_match(trimmed) {
            return RoutingDecision {
                intent: Intent::Conversational,
                requires_sql: false,
                canned_reply: Some(
                    "Hello! Ask me a question about your data and I'll turn it into a query."
                        .to_string(),
                ),
                enhanced_intent: None,
                confidence: 0.95,
            };
        }
        if IDENTITY.is_match(trimmed) {
            return RoutingDecision {
                intent: Intent::Conversational,
                requires_sql: false,
                canned_reply: Some(
                    "I'm a data assistant. I answer business questions by generating and \
                     running safe SQL against your connected databases."
                        .to_string(),
                ),
                enhanced_intent: None,
                confidence: 0.9,
            };
        }
        if METADATA.is_match(trimmed) {
            return RoutingDecision {
                intent: Intent::MetadataQuery,
                requires_sql: false,
                canned_reply: None,
                enhanced_intent: None,
                confidence: 0.9,
            };
        }

        let mentions_table = schema
            .map(|s| !s.tables_mentioned_in(trimmed).is_empty())
            .unwrap_or(false);
        let has_verb = DATA_VERB.is_match(trimmed);

        if has_verb && (mentions_table || trimmed.split_whitespace().count() >= 3) {
            return RoutingDecision {
                intent: Intent::DataQuery,
                requires_sql: true,
                canned_reply: None,
                enhanced_intent: Some(trimmed.to_string()),
                confidence: if mentions_table { 0.9 } else { 0.7 },
            };
        }
        if mentions_table {
            // Table mention without a verb still reads as a data ask.
            return RoutingDecision {
                intent: Intent::DataQuery,
                requires_sql: true,
                canned_reply: None,
                enhanced_intent: Some(trimmed.to_string()),
                confidence: 0.6,
            };
        }

        if self.llm_fallback {
            if let Some(decision) = self.classify_via_llm(llm, trimmed, cancel).await {
                return decision;
            }
        }

        RoutingDecision {
            intent: Intent::Ambiguous,
            requires_sql: false,
            canned_reply: Some(
                "I couldn't tell what data you're after. Try naming the table or metric, \
                 e.g. \"total sales by region for 2024\"."
                    .to_string(),
            ),
            enhanced_intent: None,
            confidence: 0.4,
        }
    }

    /// LLM tie-breaker. Any failure returns `None` and the caller falls
    /// back to the pattern verdict.
    async fn classify_via_llm(
        &self,
        llm: &dyn LlmProvider,
        text: &str,
        cancel: &CancellationToken,
    ) -> Option<RoutingDecision> {
        let messages = [
            LlmMessage::system(
                "Classify the user's message as exactly one word: conversational, metadata, \
                 data, or ambiguous.",
            ),
            LlmMessage::user(text),
        ];
        let response = match llm.invoke(&messages, &LlmOptions::default(), cancel).await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "router LLM fallback failed; using pattern verdict");
                return None;
            }
        };
        let verdict = response.content.trim().to_ascii_lowercase();
        let (intent, requires_sql) = match verdict.as_str() {
            "conversational" => (Intent::Conversational, false),
            "metadata" => (Intent::MetadataQuery, false),
            "data" => (Intent::DataQuery, true),
            "ambiguous" => (Intent::Ambiguous, false),
            _ => return None,
        };
        Some(RoutingDecision {
            intent,
            requires_sql,
            canned_reply: None,
            enhanced_intent: requires_sql.then(|| text.to_string()),
            confidence: 0.6,
        })
    }

    /// Render the metadata answer for a metadata-classified question.
    ///
    /// "describe X" lists X's columns; anything else lists the relations.
    #[must_use]
    pub fn metadata_reply(text: &str, schema: &SchemaSnapshot) -> String {
        static DESCRIBE: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"(?i)\bdescribe\s+(\w+)").expect("static regex"));
        if let Some(caps) = DESCRIBE.captures(text) {
            let table = &caps[1];
            if let Some(columns) = schema.columns_of(table) {
                let lines: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        format!(
                            "- {} ({}{})",
                            c.name,
                            c.data_type,
                            if c.nullable { ", nullable" } else { "" }
                        )
                    })
                    .collect();
                return format!("Columns of {}:\n{}", table.to_uppercase(), lines.join("\n"));
            }
            return format!("I don't know a table named '{table}'.");
        }
        let names = schema.all_relation_names();
        if names.is_empty() {
            "No tables are visible to this connection.".to_string()
        } else {
            format!("Available tables and views:\n- {}", names.join("\n- "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::UnconfiguredProvider;
    use indexmap::IndexMap;

    fn schema() -> SchemaSnapshot {
        let mut tables = IndexMap::new();
        tables.insert("ORDERS".to_string(), Vec::new());
        SchemaSnapshot {
            tables,
            ..SchemaSnapshot::default()
        }
    }

    async fn classify(text: &str) -> RoutingDecision {
        IntentRouter::new(false)
            .classify(
                &UnconfiguredProvider,
                text,
                &[],
                Some(&schema()),
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn greetings_short_circuit() {
        let d = classify("hello there").await;
        assert_eq!(d.intent, Intent::Conversational);
        assert!(!d.requires_sql);
        assert!(d.canned_reply.is_some());
    }

    #[tokio::test]
    async fn metadata_questions_do_not_require_sql() {
        let d = classify("what tables do you have?").await;
        assert_eq!(d.intent, Intent::MetadataQuery);
        assert!(!d.requires_sql);
    }

    #[tokio::test]
    async fn data_questions_require_sql() {
        let d = classify("total sales by region from orders").await;
        assert_eq!(d.intent, Intent::DataQuery);
        assert!(d.requires_sql);
        assert!(d.enhanced_intent.is_some());
    }

    #[tokio::test]
    async fn gibberish_is_ambiguous() {
        let d = classify("qwerty").await;
        assert_eq!(d.intent, Intent::Ambiguous);
        assert!(!d.requires_sql);
    }

    #[test]
    fn metadata_reply_lists_and_describes() {
        let mut snap = schema();
        snap.tables.insert(
            "REGIONS".to_string(),
            vec![crate::schema::ColumnInfo {
                name: "NAME".to_string(),
                data_type: "VARCHAR2(64)".to_string(),
                nullable: false,
                requires_quoting: false,
            }],
        );
        let listing = IntentRouter::metadata_reply("show tables", &snap);
        assert!(listing.contains("ORDERS"));
        let described = IntentRouter::metadata_reply("describe regions", &snap);
        assert!(described.contains("NAME"));
        assert!(described.contains("VARCHAR2"));
    }
}
