// src/wallet/party.rs
//! A party: one independent key-holder and the connection to its agent.

use crate::agent::IdentityAgent;
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::identifier::Identifier;
use std::fmt;
use std::sync::Arc;

/// One participant. `member` names the party's own single-signature identifier
/// that signs on behalf of any group it belongs to.
#[derive(Clone)]
pub struct Party {
    pub name: String,
    pub member: String,
    agent: Arc<dyn IdentityAgent>,
}

impl Party {
    pub fn new(name: impl Into<String>, member: impl Into<String>, agent: Arc<dyn IdentityAgent>) -> Self {
        Self {
            name: name.into(),
            member: member.into(),
            agent,
        }
    }

    pub fn agent(&self) -> &dyn IdentityAgent {
        self.agent.as_ref()
    }

    /// Fresh read of identifier `name`; missing is an error.
    pub async fn identifier(&self, name: &str) -> CoordinationResult<Identifier> {
        self.agent
            .get_identifier(name)
            .await?
            .ok_or_else(|| CoordinationError::IdentifierNotFound(name.to_string()))
    }

    /// Fresh read of the party's member identifier. Never reuse the result
    /// across a rotation: the signing key index moves on.
    pub async fn member_identifier(&self) -> CoordinationResult<Identifier> {
        self.identifier(&self.member).await
    }
}

impl fmt::Debug for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Party")
            .field("name", &self.name)
            .field("member", &self.member)
            .finish()
    }
}
