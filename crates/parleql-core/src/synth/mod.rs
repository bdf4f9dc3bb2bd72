//! SQL synthesis: prompt composition, LLM invocation, post-processing.
//!
//! The synthesizer is the only component that spends LLM tokens. It
//! consults the fingerprint cache first, builds the structured prompt
//! from the skills output and schema, then runs the post-processing
//! pipeline over the completion: strip, clarification marker, confidence
//! extraction, single-statement truncation, identifier normalization and
//! validation, dialect repair, and an optional cost-aware rewrite.

pub mod convert;
pub mod fingerprint;
pub mod identifiers;
pub mod postprocess;
pub mod prompt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::cost::{CostEstimator, CostLevel};
use crate::dialect::DatabaseKind;
use crate::error::{ParleQLError, Result};
use crate::llm::{LlmMessage, LlmOptions, LlmProvider};
use crate::schema::SchemaSnapshot;
use crate::skills::{ClarificationRequest, SkillsOutput};
use crate::types::{ChatTurn, GeneratedSql, LlmMetadata};

use fingerprint::FingerprintCache;

/// Minimum self-reported confidence to proceed to validation.
const MIN_SQL_CONFIDENCE: u8 = 70;
/// Confidence assumed when the completion omits the marker.
const DEFAULT_SQL_CONFIDENCE: u8 = 75;

/// Everything `synthesize` needs for one call.
pub struct SynthContext<'a> {
    /// The user's question.
    pub user_text: &'a str,
    /// Router-normalized intent, when present.
    pub enhanced_intent: Option<&'a str>,
    /// Skills output.
    pub skills: &'a SkillsOutput,
    /// Schema snapshot.
    pub schema: &'a SchemaSnapshot,
    /// Schema fingerprint (cache-key component).
    pub schema_fingerprint: &'a str,
    /// Target dialect.
    pub dialect: DatabaseKind,
    /// Caller's role, for the cost-aware rewrite gate.
    pub role: &'a str,
    /// Conversation history.
    pub history: &'a [ChatTurn],
    /// Scope constraints to surface in the prompt.
    pub scope_constraints: Vec<String>,
    /// Skip the fingerprint cache (repair and pivot passes must not be
    /// handed back the SQL that just failed).
    pub bypass_fingerprint: bool,
    /// Ticket cancellation token.
    pub cancel: &'a CancellationToken,
}

/// Outcome of a synthesis call.
pub enum SynthOutcome {
    /// SQL ready for validation.
    Sql {
        /// The generated SQL record.
        sql: GeneratedSql,
        /// Provider usage and caching metadata.
        metadata: LlmMetadata,
        /// Post-processing warnings.
        warnings: Vec<String>,
        /// Whether a cost-aware rewrite replaced the original SQL.
        cost_optimized: bool,
    },
    /// The model (or the pipeline) wants more information.
    Clarification(ClarificationRequest),
}

/// The SQL synthesizer.
pub struct Synthesizer {
    llm: Arc<dyn LlmProvider>,
    cost: Arc<dyn CostEstimator>,
    fingerprints: FingerprintCache,
    config: CoreConfig,
}

impl Synthesizer {
    /// Assemble from the composition root's collaborators.
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        cost: Arc<dyn CostEstimator>,
        kv: Arc<dyn crate::kv::KvStore>,
        config: CoreConfig,
    ) -> Self {
        let fingerprints =
            FingerprintCache::new(kv, Duration::from_secs(config.fingerprint_cache_ttl_s));
        Self {
            llm,
            cost,
            fingerprints,
            config,
        }
    }

    /// Generate SQL for a ticket.
    ///
    /// # Errors
    ///
    /// - [`ParleQLError::LlmEmpty`] on a blank completion.
    /// - [`ParleQLError::InvalidIdentifiers`] when the completion
    ///   references names outside the schema (hard stop, no retry).
    /// - [`ParleQLError::Cancelled`] when the ticket is cancelled
    ///   mid-call.
    ///
    /// Provider failures are not errors here: they come back as a
    /// [`SynthOutcome::Clarification`] with the provider message elided.
    pub async fn synthesize(&self, ctx: &SynthContext<'_>) -> Result<SynthOutcome> {
        let intent = ctx.enhanced_intent.unwrap_or("data_query");
        let cache_key = fingerprint::key(
            ctx.dialect,
            ctx.schema_fingerprint,
            ctx.user_text,
            intent,
        );

        if !ctx.bypass_fingerprint {
            if let Some(entry) = self.fingerprints.get(&cache_key).await {
                info!(usage_count = entry.usage_count, "fingerprint cache hit; skipping LLM");
                return Ok(SynthOutcome::Sql {
                    sql: GeneratedSql {
                        text: entry.sql,
                        confidence: entry.confidence,
                        dialect: ctx.dialect,
                        identifiers_normalized: true,
                        dialect_converted_from: None,
                        was_cached: true,
                    },
                    metadata: LlmMetadata {
                        was_cached: true,
                        ..LlmMetadata::default()
                    },
                    warnings: Vec::new(),
                    cost_optimized: false,
                });
            }
        }

        let messages = prompt::build(&prompt::PromptContext {
            user_text: ctx.user_text,
            enhanced_intent: ctx.enhanced_intent,
            skills: ctx.skills,
            schema: ctx.schema,
            dialect: ctx.dialect,
            history: ctx.history,
            similar_queries: &[],
            scope_constraints: &ctx.scope_constraints,
        });

        let started = Instant::now();
        let response = match self.invoke_with_timeout(&messages, ctx.cancel).await {
            Ok(response) => response,
            Err(ParleQLError::Cancelled { query_id, reason }) => {
                return Err(ParleQLError::Cancelled { query_id, reason });
            }
            Err(ParleQLError::LlmEmpty) => return Err(ParleQLError::LlmEmpty),
            Err(e) => {
                // Provider failure: surface as a clarification, provider
                // internals elided.
                warn!(error = %e, "LLM call failed; asking the user to retry");
                return Ok(SynthOutcome::Clarification(ClarificationRequest {
                    message: "I couldn't generate SQL for this question right now. \
                              Please try again, or rephrase with explicit table and \
                              column names."
                        .to_string(),
                    referenced_tables: Vec::new(),
                    unmapped_concepts: Vec::new(),
                }));
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut metadata = LlmMetadata {
            input_tokens: response.usage.map(|u| u.input_tokens),
            output_tokens: response.usage.map(|u| u.output_tokens),
            duration_ms: Some(duration_ms),
            was_cached: false,
            error_details: None,
        };

        if response.content.trim().is_empty() {
            return Err(ParleQLError::LlmEmpty);
        }

        // Post-processing pipeline, in order.
        let stripped = postprocess::strip_to_sql(&response.content);
        if stripped.is_empty() {
            return Err(ParleQLError::LlmEmpty);
        }

        if let Some(message) = postprocess::extract_clarification(&stripped) {
            debug!("completion carried a clarification marker");
            return Ok(SynthOutcome::Clarification(ClarificationRequest {
                message,
                referenced_tables: ctx
                    .skills
                    .mappings
                    .iter()
                    .map(|m| m.table.clone())
                    .filter(|t| !t.is_empty())
                    .collect(),
                unmapped_concepts: Vec::new(),
            }));
        }

        let (without_confidence, reported) = postprocess::extract_confidence(&stripped);
        let mut warnings = Vec::new();
        let confidence = reported.unwrap_or_else(|| {
            warnings.push("completion omitted the confidence marker".to_string());
            DEFAULT_SQL_CONFIDENCE
        });

        let (single, truncation_warning) = postprocess::first_statement(&without_confidence);
        if let Some(w) = truncation_warning {
            warnings.push(w);
        }

        let normalized = identifiers::normalize(&single, ctx.schema, ctx.dialect)?;
        identifiers::validate(&normalized, ctx.schema, ctx.dialect)?;

        let (mut text, dialect_converted_from) =
            match convert::validate_dialect(&normalized, ctx.dialect) {
                Ok(()) => (normalized, None),
                Err(parse_error) => {
                    debug!(error = %parse_error, "dialect validation failed; converting");
                    let from = if ctx.dialect == DatabaseKind::Oracle {
                        DatabaseKind::Postgres
                    } else {
                        DatabaseKind::Oracle
                    };
                    let (converted, convert_warnings) =
                        convert::convert(&normalized, from, ctx.dialect)?;
                    warnings.extend(convert_warnings);
                    (converted, Some(from))
                }
            };

        if confidence < MIN_SQL_CONFIDENCE {
            return Ok(SynthOutcome::Clarification(ClarificationRequest {
                message: format!(
                    "I'm only {confidence}% confident in the generated query. Could you \
                     confirm the tables and columns to use?"
                ),
                referenced_tables: Vec::new(),
                unmapped_concepts: Vec::new(),
            }));
        }

        let cost_optimized = self
            .maybe_rewrite_for_cost(&mut text, ctx, &mut warnings)
            .await;

        self.fingerprints.put(&cache_key, &text, confidence).await;
        metadata.was_cached = false;

        Ok(SynthOutcome::Sql {
            sql: GeneratedSql {
                text,
                confidence,
                dialect: ctx.dialect,
                identifiers_normalized: true,
                dialect_converted_from,
                was_cached: false,
            },
            metadata,
            warnings,
            cost_optimized,
        })
    }

    async fn invoke_with_timeout(
        &self,
        messages: &[LlmMessage],
        cancel: &CancellationToken,
    ) -> Result<crate::llm::LlmResponse> {
        let timeout = Duration::from_secs(self.config.llm_timeout_s);
        match tokio::time::timeout(timeout, self.llm.invoke(messages, &LlmOptions::default(), cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ParleQLError::llm(
                format!("LLM call exceeded {}s", self.config.llm_timeout_s),
                crate::error::LlmFailure::Timeout,
            )),
        }
    }

    /// Cost-aware rewrite: pre-estimate, and if the plan looks expensive
    /// ask the model for a semantics-preserving cheaper version. Accept
    /// only a non-empty, different, still-valid completion.
    async fn maybe_rewrite_for_cost(
        &self,
        text: &mut String,
        ctx: &SynthContext<'_>,
        warnings: &mut Vec<String>,
    ) -> bool {
        if CoreConfig::is_admin_role(ctx.role) {
            return false;
        }
        let estimate = match self.cost.estimate(text, ctx.dialect, false).await {
            Ok(estimate) => estimate,
            Err(e) => {
                debug!(error = %e, "pre-estimate failed; skipping cost rewrite");
                return false;
            }
        };
        if estimate.level < CostLevel::High && !estimate.has_full_scan {
            return false;
        }

        let rewrite_prompt = [
            LlmMessage::system(format!(
                "Rewrite the following {} SQL to be cheaper to execute while returning \
                 the same result. Keep the dialect. Return SQL only.",
                ctx.dialect
            )),
            LlmMessage::user(text.clone()),
        ];
        let Ok(response) = self.invoke_with_timeout(&rewrite_prompt, ctx.cancel).await else {
            return false;
        };
        let candidate = postprocess::strip_to_sql(&response.content);
        let (candidate, _) = postprocess::first_statement(&candidate);
        if candidate.is_empty() || candidate == *text {
            return false;
        }
        let Ok(candidate) = identifiers::normalize(&candidate, ctx.schema, ctx.dialect) else {
            return false;
        };
        if identifiers::validate(&candidate, ctx.schema, ctx.dialect).is_err()
            || convert::validate_dialect(&candidate, ctx.dialect).is_err()
        {
            return false;
        }
        warnings.push(format!(
            "rewritten for cost (was {} with{} full scan risk)",
            estimate.level.as_str(),
            if estimate.has_full_scan { "" } else { "out" },
        ));
        *text = candidate;
        true
    }
}
