// src/services/operations.rs
//! Operation poller.
//!
//! Every submit call returns an [`Operation`]; anything whose effect must be
//! observable before the next step (an anchored event, a key-state query
//! result) is passed through [`wait_operation`] first.

use crate::agent::IdentityAgent;
use crate::error::{CoordinationError, CoordinationResult};
use crate::models::operation::Operation;
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use futures::future::try_join_all;
use log::{debug, warn};

/// Re-fetches `op` until it is done, without looking at dependencies.
async fn poll_until_done(
    agent: &dyn IdentityAgent,
    op: Operation,
    policy: &RetryPolicy,
) -> CoordinationResult<Operation> {
    let attempts = policy.max_attempts.max(1);
    let mut current = op;
    let mut attempt = 0;
    while !current.done {
        if attempt == attempts {
            return Err(CoordinationError::OperationTimeout {
                name: current.name,
                attempts,
            });
        }
        tokio::time::sleep(policy.calculate_delay(attempt)).await;
        attempt += 1;
        current = agent.get_operation(&current.name).await?;
    }
    match current.error {
        Some(cause) => Err(CoordinationError::OperationFailed {
            name: current.name,
            cause,
        }),
        None => Ok(current),
    }
}

/// Waits for `op` (and the operation it depends on, if any) to finish.
///
/// # Errors
/// - [`CoordinationError::OperationTimeout`] once `policy` is exhausted
/// - [`CoordinationError::OperationFailed`] if the agent reports a terminal error
///
/// The finished operation record is deleted afterwards; failing to delete it
/// is logged and ignored.
pub async fn wait_operation(
    agent: &dyn IdentityAgent,
    op: Operation,
    policy: &RetryPolicy,
) -> CoordinationResult<Operation> {
    if let Some(dependency) = op.depends().filter(|dep| !dep.done) {
        debug!("operation waiting on dependency name={} depends={}", op.name, dependency.name);
        poll_until_done(agent, dependency, policy).await?;
    }
    let done = poll_until_done(agent, op, policy).await?;
    if let Err(e) = agent.delete_operation(&done.name).await {
        warn!("operation cleanup failed name={} error={}", done.name, e);
    }
    Ok(done)
}

/// Waits for one operation per party, concurrently. Any failure aborts the
/// whole set and names the party it came from.
pub async fn wait_all(
    pending: Vec<(&Party, Operation)>,
    policy: &RetryPolicy,
) -> CoordinationResult<Vec<Operation>> {
    try_join_all(pending.into_iter().map(|(party, op)| async move {
        wait_operation(party.agent(), op, policy)
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::error::AgentError;
    use crate::models::identifier::{InceptionArgs, RotationArgs};
    use crate::services::testing::quick;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_waits_until_done_and_cleans_up() {
        let network = LocalNetwork::new();
        let alice = network.agent("alice").unwrap();
        let bob = network.agent("bob").unwrap();
        let icp = alice.create_identifier("alice", &InceptionArgs::default()).await.unwrap();
        bob.create_identifier("bob", &InceptionArgs::default()).await.unwrap();

        let query = bob.query_key_state(icp.serder.prefix(), Some(1)).await.unwrap();
        assert!(!query.done);
        alice.rotate_identifier("alice", &RotationArgs::default()).await.unwrap();

        let done = assert_ok!(wait_operation(&bob, query.clone(), &quick(3)).await);
        assert!(done.response.is_some());
        let lookup = bob.get_operation(&query.name).await;
        assert!(matches!(lookup, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_times_out_after_policy_attempts() {
        let network = LocalNetwork::new();
        let alice = network.agent("alice").unwrap();
        let icp = alice.create_identifier("alice", &InceptionArgs::default()).await.unwrap();
        let query = alice.query_key_state(icp.serder.prefix(), Some(9)).await.unwrap();

        let err = assert_err!(wait_operation(&alice, query, &quick(3)).await);
        assert!(matches!(err, CoordinationError::OperationTimeout { attempts: 3, .. }));
        let polls = network
            .calls("alice")
            .unwrap()
            .into_iter()
            .filter(|c| c == "get_operation")
            .count();
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn test_failed_dependency_is_reported() {
        let network = LocalNetwork::new();
        let alice = network.agent("alice").unwrap();
        let icp = alice.create_identifier("alice", &InceptionArgs::default()).await.unwrap();
        let missing = alice.query_key_state("EUnknownPrefix", None).await.unwrap();
        let mut op = alice.query_key_state(icp.serder.prefix(), None).await.unwrap();
        op.done = false;
        op.metadata = Some(json!({"depends": {"name": missing.name, "done": false}}));

        let err = assert_err!(wait_operation(&alice, op, &quick(2)).await);
        match err {
            CoordinationError::OperationFailed { name, cause } => {
                assert_eq!(name, missing.name);
                assert_eq!(cause.code, 404);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
