//! Approval tokens for the human-in-the-loop gate.
//!
//! A ticket suspended at the approval gate owns exactly one un-decided
//! token. Deciding it is a one-shot operation; any second decision on the
//! same ticket comes back as a duplicate, which the HTTP layer maps to
//! 409.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ParleQLError, Result};

/// Session-bound record for a pending approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    /// Ticket waiting on the decision.
    pub ticket_id: String,
    /// Session that created the ticket.
    pub session_id: String,
    /// Client IP at submission, for the audit trail.
    pub ip: String,
    /// Client user agent at submission.
    pub user_agent: String,
    /// When the gate was reached.
    pub created_at: DateTime<Utc>,
    /// Hash of the SQL the approval covers.
    pub original_sql_hash: String,
    /// Whether a decision has been made.
    pub decided: bool,
}

/// Hash SQL for approval binding.
#[must_use]
pub fn hash_sql(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// In-process registry of pending approvals.
#[derive(Default)]
pub struct ApprovalRegistry {
    tokens: DashMap<String, ApprovalToken>,
}

impl ApprovalRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending approval for a ticket, superseding any earlier
    /// un-decided token (a re-validated ticket re-enters the gate with
    /// fresh SQL).
    pub fn register(
        &self,
        ticket_id: &str,
        session_id: &str,
        ip: &str,
        user_agent: &str,
        sql: &str,
    ) {
        self.tokens.insert(
            ticket_id.to_string(),
            ApprovalToken {
                ticket_id: ticket_id.to_string(),
                session_id: session_id.to_string(),
                ip: ip.to_string(),
                user_agent: user_agent.to_string(),
                created_at: Utc::now(),
                original_sql_hash: hash_sql(sql),
                decided: false,
            },
        );
    }

    /// Look up the token for a ticket.
    #[must_use]
    pub fn get(&self, ticket_id: &str) -> Option<ApprovalToken> {
        self.tokens.get(ticket_id).map(|t| t.clone())
    }

    /// Consume the pending decision for a ticket.
    ///
    /// # Errors
    ///
    /// - [`ParleQLError::NotFound`] when no approval is pending.
    /// - [`ParleQLError::ApprovalDuplicate`] when it was already decided.
    pub fn decide(&self, ticket_id: &str) -> Result<ApprovalToken> {
        let mut entry = self
            .tokens
            .get_mut(ticket_id)
            .ok_or_else(|| ParleQLError::not_found("approval", ticket_id))?;
        if entry.decided {
            return Err(ParleQLError::ApprovalDuplicate {
                query_id: ticket_id.to_string(),
            });
        }
        entry.decided = true;
        Ok(entry.clone())
    }

    /// Drop a ticket's token (cancel / cleanup).
    pub fn remove(&self, ticket_id: &str) {
        self.tokens.remove(ticket_id);
    }
}
