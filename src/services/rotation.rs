// src/services/rotation.rs
//! Group key rotation.
//!
//! Runs as `MembersRotating → KeyStateBarrier → GroupRotationComputed →
//! Broadcasting → PeerJoining → Converged`:
//! 1. every member rotates its own key and re-reads its local record
//! 2. every member refreshes every other member's new key state
//! 3. the initiator rotates the group from those snapshots and announces it
//! 4. each joiner waits for the announcement, submits the identical rotation
//!    and forwards its signature to the members it did not hear from
//!
//! A member whose rotation fails aborts the whole rotation; a threshold group
//! is never left rotating with a subset of its members.
//!
//! A delegated group stops after step 4 with
//! [`RotationProgress::AwaitingDelegation`]; [`complete_rotation`] finishes it
//! once the delegator has anchored the rotation.

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::event::EventResult;
use crate::models::exchange::{ExchangeMessage, ExchangePayload};
use crate::models::identifier::{Identifier, RotationArgs};
use crate::models::key_state::KeyState;
use crate::models::notification::Route;
use crate::models::operation::Operation;
use crate::services::exchange::{compose, embed, recipients, send};
use crate::services::inception::{await_approval, PendingDelegation};
use crate::services::key_state::{refresh_pairwise, Target};
use crate::services::mailbox::{mark_best_effort, wait_and_mark};
use crate::services::operations::{wait_all, wait_operation};
use crate::services::plans::GroupRotationPlan;
use crate::services::{converged_group, split_initiator, Policies};
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use futures::future::try_join_all;
use log::{info, warn};

/// Result of a converged group rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationOutcome {
    pub group: Identifier,
    /// SAID of the group rotation event every member signed
    pub said: String,
    pub sn: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RotationProgress {
    Converged(RotationOutcome),
    /// Delegated rotation signed by every member; waiting for the delegator.
    AwaitingDelegation(PendingRotation),
}

/// A delegated group rotation whose operations complete only after the
/// delegator anchors it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRotation {
    pub delegation: PendingDelegation,
    /// SAID of the rotation event every member signed
    pub said: String,
    pub sn: u64,
}

/// Rotates every party's member identifier and returns the re-read records,
/// in party order.
///
/// # Errors
/// The first member failure, wrapped with the party's name.
pub async fn rotate_members(parties: &[Party], policies: &Policies) -> CoordinationResult<Vec<Identifier>> {
    try_join_all(parties.iter().map(|party| async move {
        let rotated = async {
            let result = party
                .agent()
                .rotate_identifier(&party.member, &RotationArgs::default())
                .await?;
            wait_operation(party.agent(), result.op, &policies.operation).await?;
            // signing index advanced; the old record signs with the wrong key
            let local = party.member_identifier().await?;
            info!("member rotated party={} prefix={} sn={}", party.name, local.prefix, local.sn());
            Ok::<_, CoordinationError>(local)
        };
        rotated.await.map_err(|e| e.for_party(&party.name))
    }))
    .await
}

/// Requires every local member record to match the snapshot taken of it.
///
/// # Errors
/// [`CoordinationError::PeerDivergence`] naming the first member whose
/// snapshot predates (or otherwise differs from) its own record.
pub fn ensure_current(snapshot: &[KeyState], locals: &[Identifier]) -> CoordinationResult<()> {
    for local in locals {
        let state = snapshot
            .iter()
            .find(|s| s.prefix == local.prefix)
            .ok_or_else(|| CoordinationError::InvalidPlan(format!("no snapshot of member {}", local.prefix)))?;
        if !state.same_event(&local.state) {
            return Err(CoordinationError::PeerDivergence {
                context: format!("rotation snapshot of {}", local.prefix),
                expected: format!("{}@{}", local.state.digest, local.sn()),
                found: format!("{}@{}", state.digest, state.sn()),
            });
        }
    }
    Ok(())
}

fn rot_message(gid: &str, plan: &GroupRotationPlan, result: &EventResult, peers: Vec<String>) -> ExchangeMessage {
    compose(
        Route::MultisigRot,
        ExchangePayload::with_members(gid, plan.smids(), plan.rmids()),
        [("rot", embed(&result.serder, &result.sigs, None))],
        peers,
    )
}

async fn join_rotation(
    party: &Party,
    local: &Identifier,
    gid: &str,
    plan: &GroupRotationPlan,
    policies: &Policies,
) -> CoordinationResult<Operation> {
    let said = wait_and_mark(party, Route::MultisigRot, &policies.mailbox).await?;
    let record = party.agent().get_exchange(&said).await?;
    let announced = match record.message.embed("rot") {
        Some(rot) => rot.event.said().to_string(),
        None => {
            return Err(CoordinationError::InvalidPlan(format!(
                "rotation announcement {} carries no event",
                said
            )))
        }
    };

    let result = party.agent().rotate_identifier(&plan.group, &plan.args()).await?;
    if result.serder.said() != announced {
        return Err(CoordinationError::PeerDivergence {
            context: format!("rotation of group {}", plan.group),
            expected: announced,
            found: result.serder.said().to_string(),
        });
    }
    let peers = recipients(&plan.smids(), &[&local.prefix, &record.sender]);
    send(party, &plan.group, &rot_message(gid, plan, &result, peers)).await?;
    info!("group rotation joined party={} group={} said={}", party.name, plan.group, announced);
    Ok(result.op)
}

/// Rotates every member and then the group `group`.
///
/// Converged means every member's operation resolved and every member sees
/// the group exactly one event ahead of where it started. A delegated group
/// is returned as [`RotationProgress::AwaitingDelegation`] instead.
///
/// # Errors
/// - any member's rotation failure (fatal for the whole group)
/// - [`CoordinationError::PeerDivergence`] on differing snapshots, rotation
///   digests or resulting sequence numbers
/// - [`CoordinationError::NoMatchingNotification`] if a joiner never sees
///   the announcement
pub async fn rotate_group(parties: &[Party], group: &str, policies: &Policies) -> CoordinationResult<RotationProgress> {
    let (initiator, joiners) = split_initiator(parties)?;
    let before = converged_group(parties, group).await?;
    let sn = before.sn() + 1;

    let locals = rotate_members(parties, policies).await?;

    let members = initiator
        .agent()
        .group_members(group)
        .await
        .map_err(|e| CoordinationError::from(e).for_party(&initiator.name))?;
    let targets: Vec<Target> = members
        .signing_prefixes()
        .into_iter()
        .map(|prefix| {
            let until = locals.iter().find(|l| l.prefix == prefix).map(Identifier::sn);
            Target::new(prefix, until)
        })
        .collect();
    let states = refresh_pairwise(parties, &targets, &policies.operation).await?;
    ensure_current(&states, &locals)?;
    let plan = GroupRotationPlan::new(group, states);

    let result = initiator
        .agent()
        .rotate_identifier(group, &plan.args())
        .await
        .map_err(|e| CoordinationError::from(e).for_party(&initiator.name))?;
    let said = result.serder.said().to_string();
    let peers = recipients(&plan.smids(), &[&locals[0].prefix]);
    send(initiator, group, &rot_message(&before.prefix, &plan, &result, peers))
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    info!("group rotation submitted party={} group={} said={}", initiator.name, group, said);

    let gid = before.prefix.as_str();
    let plan_ref = &plan;
    let joined = try_join_all(joiners.iter().zip(&locals[1..]).map(|(party, local)| async move {
        join_rotation(party, local, gid, plan_ref, policies)
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await?;
    let mut pending = vec![(initiator, result.op)];
    pending.extend(joiners.iter().zip(joined));

    if let Some(delegator) = before.state.delegator() {
        info!("group rotation awaiting delegation group={} delegator={} sn={}", group, delegator, sn);
        return Ok(RotationProgress::AwaitingDelegation(PendingRotation {
            delegation: PendingDelegation {
                group: group.to_string(),
                prefix: before.prefix.clone(),
                delegator: delegator.to_string(),
                operations: pending
                    .into_iter()
                    .map(|(party, op)| (party.name.clone(), op))
                    .collect(),
            },
            said,
            sn,
        }));
    }

    wait_all(pending, &policies.operation).await?;
    converge(parties, group, said, sn, policies)
        .await
        .map(RotationProgress::Converged)
}

/// Finishes a delegated group rotation once the delegator has approved it
/// (optionally at delegator sequence number `until`).
pub async fn complete_rotation(
    parties: &[Party],
    pending: PendingRotation,
    until: Option<u64>,
    policies: &Policies,
) -> CoordinationResult<RotationOutcome> {
    let PendingRotation { delegation, said, sn } = pending;
    await_approval(parties, &delegation.delegator, delegation.operations, until, policies).await?;
    converge(parties, &delegation.group, said, sn, policies).await
}

/// Checks that every party sees the group at `sn`, then refreshes and marks
/// leftover `/multisig/rot` entries.
async fn converge(
    parties: &[Party],
    group: &str,
    said: String,
    sn: u64,
    policies: &Policies,
) -> CoordinationResult<RotationOutcome> {
    for party in parties {
        let hab = party.identifier(group).await.map_err(|e| e.for_party(&party.name))?;
        if hab.sn() != sn {
            return Err(CoordinationError::PeerDivergence {
                context: format!("sequence number of group {} seen by {}", group, party.name),
                expected: sn.to_string(),
                found: hab.sn().to_string(),
            });
        }
    }
    let after = converged_group(parties, group).await?;

    if let Err(e) = refresh_pairwise(parties, &[Target::new(after.prefix.clone(), Some(sn))], &policies.operation).await {
        warn!("post-rotation refresh failed group={} error={}", group, e);
    }
    for party in parties {
        mark_best_effort(party, Route::MultisigRot, &RetryPolicy::once()).await;
    }
    info!("group rotation converged group={} sn={} said={}", group, sn, said);
    Ok(RotationOutcome { group: after, said, sn })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::error::AgentError;
    use crate::models::key_state::Threshold;
    use crate::services::inception::{complete_delegation, incept_group, InceptionOutcome};
    use crate::services::member_identifiers;
    use crate::services::testing::{fast_policies, group_of, incepted, plan_for};
    use tokio_test::{assert_err, assert_ok};

    fn two_of_three() -> Threshold {
        Threshold::Weighted(vec!["1/2".to_string(); 3])
    }

    fn converged(progress: RotationProgress) -> RotationOutcome {
        match progress {
            RotationProgress::Converged(outcome) => outcome,
            other => panic!("rotation did not converge: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_threshold_group_rotates_once_regardless_of_order() {
        let network = LocalNetwork::new();
        let mut parties = incepted(&network, &["qar1", "qar2", "qar3"], "qvi", two_of_three()).await;
        // joiners listed out of signing order
        parties.swap(1, 2);
        let prefix = parties[0].identifier("qvi").await.unwrap().prefix;

        let outcome = converged(assert_ok!(rotate_group(&parties, "qvi", &fast_policies()).await));
        assert_eq!(outcome.sn, 1);
        assert_eq!(outcome.group.prefix, prefix);
        for party in &parties {
            assert_eq!(party.identifier("qvi").await.unwrap().sn(), 1);
        }
        let published = network.published_state(&prefix).unwrap().unwrap();
        assert_eq!(published.sn(), 1);
        assert_eq!(published.digest, outcome.said);
    }

    #[tokio::test]
    async fn test_rotation_embeds_new_member_keys() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2"], "qvi", Threshold::Count(2)).await;
        let outcome = converged(assert_ok!(rotate_group(&parties, "qvi", &fast_policies()).await));

        let members = member_identifiers(&parties).await.unwrap();
        let keys: Vec<String> = members.iter().map(|m| m.state.keys[0].clone()).collect();
        assert_eq!(outcome.group.state.keys, keys);
        assert!(members.iter().all(|m| m.sn() == 1));
    }

    #[tokio::test]
    async fn test_refused_member_rotation_aborts_group() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2", "qar3"], "qvi", two_of_three()).await;
        let prefix = parties[0].identifier("qvi").await.unwrap().prefix;
        network.refuse_rotation("qar2", "qar2").unwrap();

        let err = assert_err!(rotate_group(&parties, "qvi", &fast_policies()).await);
        assert!(matches!(err, CoordinationError::Party { ref party, .. } if party == "qar2"));
        assert!(matches!(err.root(), CoordinationError::Agent(AgentError::Rejected(_))));
        assert_eq!(network.published_state(&prefix).unwrap().unwrap().sn(), 0);
        for party in &parties {
            assert_eq!(party.identifier("qvi").await.unwrap().sn(), 0);
        }
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_detected() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let stale = plan_for(&parties, "qvi", Threshold::Count(2)).await.states;
        assert_ok!(ensure_current(&stale, &member_identifiers(&parties).await.unwrap()));

        let locals = rotate_members(&parties, &fast_policies()).await.unwrap();
        let err = assert_err!(ensure_current(&stale, &locals));
        assert!(matches!(err, CoordinationError::PeerDivergence { .. }));

        let fresh = plan_for(&parties, "qvi", Threshold::Count(2)).await.states;
        assert_ok!(ensure_current(&fresh, &locals));
    }

    #[tokio::test]
    async fn test_sequential_rotations() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2", "qar3"], "qvi", Threshold::Count(3)).await;

        let first = converged(assert_ok!(rotate_group(&parties, "qvi", &fast_policies()).await));
        let second = converged(assert_ok!(rotate_group(&parties, "qvi", &fast_policies()).await));
        assert_eq!(first.sn, 1);
        assert_eq!(second.sn, 2);
        assert_ne!(first.said, second.said);
        for party in &parties {
            let leftovers = party.agent().list_notifications().await.unwrap();
            assert!(leftovers.iter().all(|n| !n.is_unread_for(Route::MultisigRot)));
        }
    }

    #[tokio::test]
    async fn test_joiner_without_announcement_times_out() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2"], "qvi", Threshold::Count(2)).await;
        network.mute_mailbox("qar2", true).unwrap();

        let err = assert_err!(rotate_group(&parties, "qvi", &fast_policies()).await);
        assert!(matches!(err.root(), CoordinationError::NoMatchingNotification { route: Route::MultisigRot, .. }));
        let calls = network.calls("qar2").unwrap();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "rotate_identifier").count(), 1);
    }

    #[tokio::test]
    async fn test_delegated_rotation_waits_for_delegator() {
        let network = LocalNetwork::new();
        let geda = group_of(&network, &["geda"]).await;
        let geda_prefix = geda[0].member_identifier().await.unwrap().prefix;
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let plan = plan_for(&parties, "qvi", Threshold::Count(2))
            .await
            .delegated_by(geda_prefix.clone());
        let pending = match incept_group(&parties, &plan, &fast_policies()).await.unwrap() {
            InceptionOutcome::AwaitingDelegation(pending) => pending,
            other => panic!("unexpected outcome {:?}", other),
        };
        let approved = network.approve_delegation(&pending.prefix).unwrap();
        let group = complete_delegation(&parties, pending, Some(approved), &fast_policies())
            .await
            .unwrap();

        let pending = match assert_ok!(rotate_group(&parties, "qvi", &fast_policies()).await) {
            RotationProgress::AwaitingDelegation(pending) => pending,
            other => panic!("unexpected progress {:?}", other),
        };
        assert_eq!(pending.sn, 1);
        assert_eq!(pending.delegation.prefix, group.prefix);
        assert_eq!(pending.delegation.delegator, geda_prefix);
        assert_eq!(pending.delegation.operations.len(), 2);

        // unanchored, the members' operations never resolve
        let err = assert_err!(complete_rotation(&parties, pending.clone(), None, &fast_policies()).await);
        assert!(matches!(err.root(), CoordinationError::OperationTimeout { .. }));

        let approved = network.approve_delegation(&group.prefix).unwrap();
        let outcome = assert_ok!(complete_rotation(&parties, pending, Some(approved), &fast_policies()).await);
        assert_eq!(outcome.sn, 1);
        assert_eq!(outcome.group.state.delegator(), Some(geda_prefix.as_str()));
        let published = network.published_state(&group.prefix).unwrap().unwrap();
        assert_eq!(published.digest, outcome.said);
        for party in &parties {
            assert_eq!(party.identifier("qvi").await.unwrap().sn(), 1);
        }
    }
}
