//! Request-context extraction.
//!
//! Authentication itself happens in middleware outside this service; by
//! the time a request lands here the gateway trusts the identity
//! headers. Development mode fills in an anonymous identity so the API
//! is usable without the auth stack.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::state::AppState;
use parleql_core::ParleQLError;

use crate::error::ApiError;

/// The caller's identity and session, from trusted headers.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User id.
    pub user: String,
    /// Role name.
    pub role: String,
    /// Session id.
    pub session_id: String,
    /// Client IP, best effort.
    pub ip: String,
    /// Client user agent.
    pub user_agent: String,
}

impl AuthContext {
    /// Whether this caller holds the admin role.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        parleql_core::CoreConfig::is_admin_role(&self.role)
    }

    /// Whether this caller may see a ticket owned by `owner`.
    #[must_use]
    pub fn may_access(&self, owner: &str) -> bool {
        self.is_admin() || self.user == owner
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let user = header(parts, "x-user-id").map(ToString::to_string);
        let role = header(parts, "x-user-role").map(ToString::to_string);

        let (user, role) = match (user, role) {
            (Some(user), Some(role)) => (user, role),
            (Some(user), None) => (user, "analyst".to_string()),
            (None, _) if state.core.config.dev_mode => {
                ("anonymous".to_string(), "analyst".to_string())
            }
            (None, _) => {
                return Err(ApiError(ParleQLError::unauthorized(
                    "missing identity headers",
                )));
            }
        };

        Ok(Self {
            user,
            role,
            session_id: header(parts, "x-session-id")
                .unwrap_or("default")
                .to_string(),
            ip: header(parts, "x-forwarded-for")
                .unwrap_or_default()
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string(),
            user_agent: header(parts, "user-agent").unwrap_or_default().to_string(),
        })
    }
}
