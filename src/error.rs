// src/error.rs
//! Error taxonomy for the coordination protocol.
//!
//! Two layers are distinguished:
//! - [`AgentError`]: the remote identity agent (or its transport) refused or failed a call
//! - [`CoordinationError`]: a protocol step could not complete (timeouts, missing
//!   rendezvous notifications, divergent group state)
//!
//! Primitive failures bubble up unchanged; each orchestrator step decides whether a
//! failure aborts the workflow or is logged and swallowed.

use crate::models::notification::Route;
use crate::models::operation::OperationFailure;
use thiserror::Error;

/// Failures reported by an [`IdentityAgent`](crate::agent::IdentityAgent) implementation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed agent payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid agent url: {0}")]
    Url(#[from] url::ParseError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Failures of a coordination step.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The mailbox held no unread entry for `route` after every attempt.
    #[error("no unread notification with route {route} after {attempts} attempt(s)")]
    NoMatchingNotification { route: Route, attempts: u32 },

    #[error("operation {name} still pending after {attempts} poll(s)")]
    OperationTimeout { name: String, attempts: u32 },

    #[error("operation {name} failed: {cause}")]
    OperationFailed { name: String, cause: OperationFailure },

    #[error("credential {said} is not yet visible")]
    CredentialNotYetVisible { said: String },

    /// Members derived different group state from what must be identical input.
    #[error("peer divergence in {context}: expected {expected}, found {found}")]
    PeerDivergence {
        context: String,
        expected: String,
        found: String,
    },

    #[error("stale key state for {prefix}: wanted sn >= {wanted}, agent returned sn {found}")]
    StaleKeyState { prefix: String, wanted: u64, found: u64 },

    #[error("identifier {0} not found")]
    IdentifierNotFound(String),

    #[error("no credential registry for group {0}")]
    RegistryNotFound(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Wraps a member's failure so the cause chain names the party involved.
    #[error("party {party} failed")]
    Party {
        party: String,
        #[source]
        source: Box<CoordinationError>,
    },
}

impl CoordinationError {
    /// Whether a bounded retry loop may re-run the step that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoordinationError::NoMatchingNotification { .. }
            | CoordinationError::CredentialNotYetVisible { .. } => true,
            CoordinationError::Party { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn for_party(self, party: &str) -> Self {
        CoordinationError::Party {
            party: party.to_string(),
            source: Box::new(self),
        }
    }

    /// Strips [`CoordinationError::Party`] wrappers.
    pub fn root(&self) -> &CoordinationError {
        match self {
            CoordinationError::Party { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type CoordinationResult<T> = Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_retryable_classification() {
        let missing = CoordinationError::NoMatchingNotification {
            route: Route::MultisigIcp,
            attempts: 3,
        };
        assert!(missing.is_retryable());
        assert!(missing.for_party("qar2").is_retryable());

        let timeout = CoordinationError::OperationTimeout {
            name: "query.E123".into(),
            attempts: 10,
        };
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_party_wrapper_keeps_cause_chain() {
        let err = CoordinationError::IdentifierNotFound("qvi".into()).for_party("qar3");
        assert_eq!(err.to_string(), "party qar3 failed");
        let source = err.source().expect("wrapped source");
        assert_eq!(source.to_string(), "identifier qvi not found");
        assert!(matches!(err.root(), CoordinationError::IdentifierNotFound(_)));
    }
}
