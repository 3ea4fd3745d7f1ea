// src/services/mod.rs
//! Coordination protocol services.
//!
//! Primitives ([`operations`], [`mailbox`], [`exchange`], [`key_state`]) are
//! composed by the orchestrators ([`inception`], [`rotation`], [`issuance`]).
//! Every orchestrator takes the ordered member parties; the party at index 0
//! is the initiator and never waits on its mailbox before acting.

pub mod exchange;
pub mod inception;
pub mod issuance;
pub mod key_state;
pub mod mailbox;
pub mod operations;
pub mod plans;
pub mod rotation;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::identifier::Identifier;
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use futures::future::try_join_all;
use std::time::Duration;

/// Bounded-wait policies for one workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct Policies {
    pub operation: RetryPolicy,
    pub mailbox: RetryPolicy,
    pub credential: RetryPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            operation: RetryPolicy::exponential(20, Duration::from_millis(250), Duration::from_secs(5)),
            mailbox: RetryPolicy::default(),
            credential: RetryPolicy::fixed(20, Duration::from_secs(1)),
        }
    }
}

/// Splits the ordered members into initiator and joiners.
pub(crate) fn split_initiator(parties: &[Party]) -> CoordinationResult<(&Party, &[Party])> {
    parties
        .split_first()
        .ok_or_else(|| CoordinationError::InvalidPlan("a group action needs at least one party".into()))
}

/// Fresh member identifiers of every party, in party order.
pub async fn member_identifiers(parties: &[Party]) -> CoordinationResult<Vec<Identifier>> {
    try_join_all(parties.iter().map(|party| async move {
        party
            .member_identifier()
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await
}

/// Reads `group` on every party and requires all of them to agree on its prefix.
pub(crate) async fn converged_group(parties: &[Party], group: &str) -> CoordinationResult<Identifier> {
    let habs = try_join_all(parties.iter().map(|party| async move {
        party.identifier(group).await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;
    let (first, rest) = habs
        .split_first()
        .ok_or_else(|| CoordinationError::InvalidPlan("a group action needs at least one party".into()))?;
    for hab in rest {
        if hab.prefix != first.prefix {
            return Err(CoordinationError::PeerDivergence {
                context: format!("prefix of group {}", group),
                expected: first.prefix.clone(),
                found: hab.prefix.clone(),
            });
        }
    }
    Ok(first.clone())
}
