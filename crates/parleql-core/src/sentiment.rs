//! User sentiment tracking and frustration detection.
//!
//! Every submission is scored against keyword tables, reformulation
//! detection, and the user's recent failure history. The orchestrator
//! uses the assessment to adapt: clarification prompts get simpler
//! wording, default-on approval friction is waived (never a forced
//! approval), and persistent frustration raises an escalation flag.
//! Profiles live in the KV store; a failing store degrades to a neutral
//! assessment.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::kv::KvStore;
use crate::skills::aliases::similarity;

/// Sentiment classification, from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLevel {
    /// Explicit praise.
    VeryPositive,
    /// Mildly positive.
    Positive,
    /// No signal either way.
    Neutral,
    /// Mild negativity.
    Negative,
    /// Clear frustration.
    Frustrated,
    /// Hostile or giving up.
    VeryFrustrated,
}

/// Kinds of frustration evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrustrationSignal {
    /// Negative vocabulary in the prompt.
    NegativeKeywords,
    /// Hostile vocabulary in the prompt.
    ExplicitComplaint,
    /// The same question asked again, rephrased.
    QueryReformulation,
    /// Two or more consecutive failed tickets.
    RepeatedFailures,
    /// The previous answer took too long.
    LongWaitTime,
}

/// How the pipeline should adapt its behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAdaptation {
    /// Nothing special.
    Continue,
    /// Shorter, plainer clarifications and messages.
    SimplifyExplanations,
    /// Walk the user through column choices explicitly.
    OfferGuidedClarification,
    /// Flag for a human to step in.
    Escalate,
}

/// Pure text-scoring result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentScore {
    /// 0.0 (hostile) to 1.0 (delighted).
    pub score: f32,
    /// Bucketed level.
    pub level: SentimentLevel,
    /// Keywords that moved the score.
    pub keywords_found: Vec<String>,
    /// Scoring confidence in [0, 1].
    pub confidence: f32,
}

/// Per-submission assessment consumed by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentAssessment {
    /// Bucketed sentiment of the prompt.
    pub level: SentimentLevel,
    /// 0.0 (calm) to 1.0 (boiling). High is worse.
    pub frustration_level: f32,
    /// Evidence collected.
    pub signals: Vec<FrustrationSignal>,
    /// Whether adaptation should kick in.
    pub is_frustrated: bool,
    /// Whether a human should be alerted.
    pub should_escalate: bool,
    /// Recommended behavior change.
    pub recommended_action: ResponseAdaptation,
}

impl SentimentAssessment {
    /// The assessment used when tracking is disabled or the store is
    /// unreachable.
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            level: SentimentLevel::Neutral,
            frustration_level: 0.0,
            signals: Vec::new(),
            is_frustrated: false,
            should_escalate: false,
            recommended_action: ResponseAdaptation::Continue,
        }
    }
}

/// Hostile vocabulary; each hit costs 0.3.
const VERY_FRUSTRATED_KEYWORDS: &[&str] = &[
    "useless", "garbage", "broken", "hate", "terrible", "awful", "worst", "junk", "trash",
    "incompetent", "stupid", "dumb", "ridiculous", "pathetic",
];
/// Frustrated vocabulary; each hit costs 0.15.
const FRUSTRATED_KEYWORDS: &[&str] = &[
    "frustrating", "annoying", "confusing", "disappointing", "not working", "doesn't work",
    "not helpful", "waste of time", "pointless", "struggling",
];
/// Concerned vocabulary; each hit costs 0.05.
const CONCERNED_KEYWORDS: &[&str] = &[
    "confused", "unsure", "unclear", "hard to", "can't understand", "not clear", "wrong",
    "incorrect", "error", "problem", "issue", "failed",
];
/// Positive vocabulary; each hit refunds 0.1.
const POSITIVE_KEYWORDS: &[&str] = &[
    "good", "great", "excellent", "helpful", "perfect", "awesome", "amazing", "love",
    "fantastic", "brilliant", "thanks", "thank you",
];

/// Frustration level at which adaptation kicks in.
const FRUSTRATION_THRESHOLD: f32 = 0.4;
/// Frustration level at which escalation is recommended outright.
const ESCALATION_LEVEL: f32 = 0.8;
/// Distinct signals that force an escalation recommendation.
const ESCALATION_SIGNAL_COUNT: usize = 3;
/// Frustrated interactions before escalation is recommended.
const ESCALATION_FRUSTRATION_COUNT: u32 = 3;
/// Response time that reads as "too slow", milliseconds.
const LONG_WAIT_MS: u64 = 30_000;
/// Similarity ratio above which a new prompt reads as a reformulation
/// of a recent one.
const REFORMULATION_SIMILARITY: f64 = 0.6;
/// Recent prompts kept per user for reformulation detection.
const RECENT_QUERIES_KEPT: usize = 5;
/// Profile TTL: a week of inactivity resets the slate.
const PROFILE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Whether a single word belongs to the sentiment vocabulary. The
/// skills engine uses this to keep complaint words out of the business
/// concepts it tries to map.
#[must_use]
pub fn is_sentiment_word(word: &str) -> bool {
    let lowered = word.to_lowercase();
    VERY_FRUSTRATED_KEYWORDS
        .iter()
        .chain(FRUSTRATED_KEYWORDS)
        .chain(CONCERNED_KEYWORDS)
        .chain(POSITIVE_KEYWORDS)
        .any(|k| *k == lowered)
}

/// Score the text alone. Pure function, no store access.
#[must_use]
pub fn analyze_text(text: &str) -> SentimentScore {
    let lowered = text.to_lowercase();
    let mut keywords_found = Vec::new();
    let mut score = 0.6_f32;

    let mut count_hits = |table: &[&str]| -> usize {
        let mut hits = 0;
        for keyword in table {
            if lowered.contains(keyword) {
                keywords_found.push((*keyword).to_string());
                hits += 1;
            }
        }
        hits
    };

    let very_frustrated = count_hits(VERY_FRUSTRATED_KEYWORDS);
    let frustrated = count_hits(FRUSTRATED_KEYWORDS);
    let concerned = count_hits(CONCERNED_KEYWORDS);
    let positive = count_hits(POSITIVE_KEYWORDS);

    score -= very_frustrated as f32 * 0.3;
    score -= frustrated as f32 * 0.15;
    score -= concerned as f32 * 0.05;
    score += positive as f32 * 0.1;
    score = score.clamp(0.0, 1.0);

    let level = if score >= 0.9 {
        SentimentLevel::VeryPositive
    } else if score >= 0.7 {
        SentimentLevel::Positive
    } else if score >= 0.5 {
        SentimentLevel::Neutral
    } else if score >= 0.3 {
        SentimentLevel::Negative
    } else if score >= 0.1 {
        SentimentLevel::Frustrated
    } else {
        SentimentLevel::VeryFrustrated
    };

    let word_count = text.split_whitespace().count().max(1);
    let confidence = (keywords_found.len() as f32 / word_count as f32 + 0.3).min(1.0);

    SentimentScore {
        score,
        level,
        keywords_found,
        confidence,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Profile {
    consecutive_failures: u32,
    frustration_count: u32,
    last_response_time_ms: u64,
    recent_queries: Vec<String>,
}

/// KV-backed sentiment tracker.
pub struct SentimentTracker {
    kv: Arc<dyn KvStore>,
    enabled: bool,
}

impl SentimentTracker {
    /// Create a tracker over a KV store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, enabled: bool) -> Self {
        Self { kv, enabled }
    }

    /// Assess a submission at routing time: text sentiment plus profile
    /// signals. Updates the user's recent-query window.
    pub async fn assess(&self, user: &str, text: &str) -> SentimentAssessment {
        if !self.enabled {
            return SentimentAssessment::neutral();
        }
        let sentiment = analyze_text(text);
        let mut profile = self.load_profile(user).await;

        let mut signals = Vec::new();
        if sentiment.level == SentimentLevel::VeryFrustrated {
            signals.push(FrustrationSignal::ExplicitComplaint);
        } else if sentiment.level == SentimentLevel::Frustrated {
            signals.push(FrustrationSignal::NegativeKeywords);
        }
        let normalized = normalize_query(text);
        if profile.recent_queries.iter().any(|prior| {
            prior != &normalized && similarity(prior, &normalized) >= REFORMULATION_SIMILARITY
        }) {
            signals.push(FrustrationSignal::QueryReformulation);
        }
        if profile.consecutive_failures >= 2 {
            signals.push(FrustrationSignal::RepeatedFailures);
        }
        if profile.last_response_time_ms > LONG_WAIT_MS {
            signals.push(FrustrationSignal::LongWaitTime);
        }

        // High is worse. A neutral prompt (score 0.6) contributes zero;
        // signals compound on top of the text score.
        let text_frustration = (0.6 - sentiment.score).max(0.0) / 0.6;
        let frustration_level =
            (text_frustration + signals.len() as f32 * 0.15).clamp(0.0, 1.0);
        let is_frustrated = frustration_level >= FRUSTRATION_THRESHOLD;

        if is_frustrated {
            profile.frustration_count += 1;
        }
        let should_escalate = frustration_level >= ESCALATION_LEVEL
            || signals.len() >= ESCALATION_SIGNAL_COUNT
            || profile.frustration_count >= ESCALATION_FRUSTRATION_COUNT;

        let recommended_action = if should_escalate {
            ResponseAdaptation::Escalate
        } else if signals.contains(&FrustrationSignal::QueryReformulation) {
            ResponseAdaptation::OfferGuidedClarification
        } else if is_frustrated {
            ResponseAdaptation::SimplifyExplanations
        } else {
            ResponseAdaptation::Continue
        };

        profile.recent_queries.push(normalized);
        if profile.recent_queries.len() > RECENT_QUERIES_KEPT {
            let excess = profile.recent_queries.len() - RECENT_QUERIES_KEPT;
            profile.recent_queries.drain(..excess);
        }
        self.save_profile(user, &profile).await;

        if should_escalate {
            info!(user, frustration_level, "user frustration escalation recommended");
        } else if is_frustrated {
            debug!(user, frustration_level, "adapting responses for frustrated user");
        }

        SentimentAssessment {
            level: sentiment.level,
            frustration_level,
            signals,
            is_frustrated,
            should_escalate,
            recommended_action,
        }
    }

    /// Record how the ticket ended, feeding the failure streak and wait
    /// time into the next assessment.
    pub async fn record_outcome(&self, user: &str, success: bool, response_time_ms: u64) {
        if !self.enabled {
            return;
        }
        let mut profile = self.load_profile(user).await;
        if success {
            profile.consecutive_failures = 0;
        } else {
            profile.consecutive_failures += 1;
        }
        profile.last_response_time_ms = response_time_ms;
        self.save_profile(user, &profile).await;
    }

    async fn load_profile(&self, user: &str) -> Profile {
        match self.kv.get(&profile_key(user)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_default(),
            Ok(None) => Profile::default(),
            Err(e) => {
                warn!(error = %e, "sentiment profile read failed; assuming neutral");
                Profile::default()
            }
        }
    }

    async fn save_profile(&self, user: &str, profile: &Profile) {
        let Ok(serialized) = serde_json::to_string(profile) else {
            return;
        };
        if let Err(e) = self.kv.setex(&profile_key(user), PROFILE_TTL, &serialized).await {
            warn!(error = %e, "sentiment profile write failed");
        }
    }
}

fn profile_key(user: &str) -> String {
    format!("sentiment:user:{user}")
}

fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Rewrite a clarification message into the simpler register frustrated
/// users get.
#[must_use]
pub fn simplify_clarification(message: &str, assessment: &SentimentAssessment) -> String {
    if !assessment.is_frustrated {
        return message.to_string();
    }
    // Keep only the first sentence of the original ask and lead with a
    // short, concrete instruction.
    let first_sentence = message.split(". ").next().unwrap_or(message).trim_end_matches('.');
    format!(
        "Let's take this one step at a time. {first_sentence}. \
         A short answer like 'use COLUMN_NAME' is enough."
    )
}
