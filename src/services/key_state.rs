// src/services/key_state.rs
//! Key-state refresh.
//!
//! Snapshots are queried fresh right before each event that embeds them and
//! never carried across workflow steps. A refresh that times out or is
//! rejected aborts the enclosing step.

use crate::error::{AgentError, CoordinationError, CoordinationResult};
use crate::models::key_state::KeyState;
use crate::services::operations::wait_operation;
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use futures::future::try_join_all;
use log::debug;

/// A prefix to refresh and, optionally, the sequence number it must have reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub prefix: String,
    pub until: Option<u64>,
}

impl Target {
    pub fn new(prefix: impl Into<String>, until: Option<u64>) -> Self {
        Self {
            prefix: prefix.into(),
            until,
        }
    }
}

/// Queries `prefix` through `party`'s agent and returns the resolved snapshot.
///
/// # Errors
/// - poller errors of the query operation
/// - [`CoordinationError::StaleKeyState`] if the result is below `until`
pub async fn refresh(
    party: &Party,
    prefix: &str,
    until: Option<u64>,
    policy: &RetryPolicy,
) -> CoordinationResult<KeyState> {
    let op = party.agent().query_key_state(prefix, until).await?;
    let done = wait_operation(party.agent(), op, policy).await?;
    let response = done
        .response
        .ok_or_else(|| AgentError::NotFound(format!("key state response for {}", prefix)))?;
    let state: KeyState = serde_json::from_value(response).map_err(AgentError::from)?;
    if let Some(wanted) = until {
        if state.sn() < wanted {
            return Err(CoordinationError::StaleKeyState {
                prefix: prefix.to_string(),
                wanted,
                found: state.sn(),
            });
        }
    }
    debug!("key state refreshed party={} prefix={} sn={}", party.name, prefix, state.sn());
    Ok(state)
}

/// Every party refreshes every target; all views must agree.
///
/// Returns the snapshots in target order.
pub async fn refresh_pairwise(
    parties: &[Party],
    targets: &[Target],
    policy: &RetryPolicy,
) -> CoordinationResult<Vec<KeyState>> {
    let views = try_join_all(parties.iter().map(|party| async move {
        let mut view = Vec::with_capacity(targets.len());
        for target in targets {
            let state = refresh(party, &target.prefix, target.until, policy)
                .await
                .map_err(|e| e.for_party(&party.name))?;
            view.push(state);
        }
        Ok::<_, CoordinationError>((party.name.clone(), view))
    }))
    .await?;
    consistent_view(views)
}

/// Collapses per-party views into one, failing on any disagreement.
pub fn consistent_view(views: Vec<(String, Vec<KeyState>)>) -> CoordinationResult<Vec<KeyState>> {
    let mut views = views.into_iter();
    let Some((_, reference)) = views.next() else {
        return Ok(Vec::new());
    };
    for (party, view) in views {
        for (expected, found) in reference.iter().zip(view.iter()) {
            if !expected.same_event(found) {
                return Err(CoordinationError::PeerDivergence {
                    context: format!("key state of {} seen by {}", expected.prefix, party),
                    expected: format!("{}@{}", expected.digest, expected.sn()),
                    found: format!("{}@{}", found.digest, found.sn()),
                });
            }
        }
    }
    Ok(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::models::identifier::RotationArgs;
    use crate::services::testing::{group_of, quick};
    use crate::services::member_identifiers;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn state(prefix: &str, sn: &str, digest: &str) -> KeyState {
        serde_json::from_value(json!({"i": prefix, "s": sn, "d": digest})).unwrap()
    }

    #[tokio::test]
    async fn test_refresh_after_rotation() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let members = member_identifiers(&parties).await.unwrap();
        parties[1]
            .agent()
            .rotate_identifier("qar2", &RotationArgs::default())
            .await
            .unwrap();

        let fresh = assert_ok!(refresh(&parties[0], &members[1].prefix, Some(1), &quick(3)).await);
        assert_eq!(fresh.sn(), 1);
        assert_ne!(fresh.digest, members[1].state.digest);
    }

    #[tokio::test]
    async fn test_refresh_unknown_prefix_fails() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1"]).await;
        let err = assert_err!(refresh(&parties[0], "EUnknown", None, &quick(2)).await);
        assert!(matches!(err, CoordinationError::OperationFailed { .. }));
    }

    #[tokio::test]
    async fn test_pairwise_refresh_returns_target_order() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2", "qar3"]).await;
        let members = member_identifiers(&parties).await.unwrap();
        let targets: Vec<Target> = members
            .iter()
            .rev()
            .map(|hab| Target::new(hab.prefix.clone(), None))
            .collect();

        let view = assert_ok!(refresh_pairwise(&parties, &targets, &quick(3)).await);
        let prefixes: Vec<&str> = view.iter().map(|s| s.prefix.as_str()).collect();
        assert_eq!(
            prefixes,
            vec![
                members[2].prefix.as_str(),
                members[1].prefix.as_str(),
                members[0].prefix.as_str()
            ]
        );
    }

    #[test]
    fn test_divergent_views_are_rejected() {
        let agreed = vec![state("EA", "1", "EDa1"), state("EB", "2", "EDb2")];
        let lagging = vec![state("EA", "1", "EDa1"), state("EB", "1", "EDb1")];

        assert_ok!(consistent_view(vec![
            ("qar1".into(), agreed.clone()),
            ("qar2".into(), agreed.clone()),
        ]));
        let err = assert_err!(consistent_view(vec![
            ("qar1".into(), agreed),
            ("qar2".into(), lagging),
        ]));
        match err {
            CoordinationError::PeerDivergence { context, expected, found } => {
                assert!(context.contains("qar2"));
                assert_eq!(expected, "EDb2@2");
                assert_eq!(found, "EDb1@1");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
