// src/services/inception.rs
//! Group inception and end-role authorization.
//!
//! Both follow the same rendezvous:
//! 1. the initiator submits its local request and announces it to every peer
//! 2. each joiner waits for the announcement in its own mailbox, submits the
//!    identical request and fans its own exchange out to the other members
//! 3. every member's operation is awaited and the initiator collects one
//!    confirmation per joiner
//!
//! Both steps re-read remote state first and return the existing result when
//! every member already has it.

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::event::{EventResult, SealEvent};
use crate::models::exchange::{ExchangeMessage, ExchangePayload};
use crate::models::identifier::Identifier;
use crate::models::notification::Route;
use crate::models::operation::Operation;
use crate::services::exchange::{compose, embed, recipients, send, DeliveryLedger};
use crate::services::key_state::refresh;
use crate::services::mailbox::{await_confirmations, wait_and_consume, wait_and_mark};
use crate::services::operations::wait_all;
use crate::services::plans::{EndRolePlan, GroupInceptionPlan};
use crate::services::{converged_group, member_identifiers, split_initiator, Policies};
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use futures::future::try_join_all;
use log::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum InceptionOutcome {
    /// Every member already held the group; nothing was submitted.
    Existing(Identifier),
    Converged(Identifier),
    /// Delegated inception submitted; waiting for the delegator to approve.
    AwaitingDelegation(PendingDelegation),
}

/// A delegated group inception whose operations complete only after the
/// delegator anchors it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDelegation {
    pub group: String,
    pub prefix: String,
    pub delegator: String,
    /// Pending inception operation per party name
    pub operations: Vec<(String, Operation)>,
}

/// The group on every party, if every party has it.
async fn existing_group(parties: &[Party], group: &str) -> CoordinationResult<Option<Identifier>> {
    let habs = try_join_all(parties.iter().map(|party| async move {
        party
            .agent()
            .get_identifier(group)
            .await
            .map_err(|e| CoordinationError::from(e).for_party(&party.name))
    }))
    .await?;
    if habs.iter().any(Option::is_none) {
        if habs.iter().any(Option::is_some) {
            info!("group partially present, resuming inception group={}", group);
        }
        return Ok(None);
    }
    converged_group(parties, group).await.map(Some)
}

fn icp_message(plan: &GroupInceptionPlan, result: &EventResult, peers: Vec<String>) -> ExchangeMessage {
    compose(
        Route::MultisigIcp,
        ExchangePayload::with_members(result.serder.prefix(), plan.smids(), plan.rmids()),
        [("icp", embed(&result.serder, &result.sigs, None))],
        peers,
    )
}

async fn join_inception(
    party: &Party,
    member: &Identifier,
    plan: &GroupInceptionPlan,
    policies: &Policies,
) -> CoordinationResult<Operation> {
    let said = wait_and_mark(party, Route::MultisigIcp, &policies.mailbox).await?;
    let record = party.agent().get_exchange(&said).await?;
    let announced = record
        .message
        .embed("icp")
        .map(|e| e.event.prefix().to_string())
        .unwrap_or_else(|| record.message.payload.gid.clone());

    let result = party
        .agent()
        .create_identifier(&plan.group, &plan.args(&party.member))
        .await?;
    if result.serder.prefix() != announced {
        return Err(CoordinationError::PeerDivergence {
            context: format!("inception of group {}", plan.group),
            expected: announced,
            found: result.serder.prefix().to_string(),
        });
    }
    let peers = recipients(&plan.smids(), &[&member.prefix]);
    send(party, &plan.group, &icp_message(plan, &result, peers)).await?;
    info!("group inception joined party={} group={} prefix={}", party.name, plan.group, announced);
    Ok(result.op)
}

/// Creates the group described by `plan` on every party.
///
/// # Errors
/// - [`CoordinationError::NoMatchingNotification`] if a joiner never sees the announcement
/// - [`CoordinationError::PeerDivergence`] if members derive different prefixes
/// - poller errors of any member's inception operation
pub async fn incept_group(
    parties: &[Party],
    plan: &GroupInceptionPlan,
    policies: &Policies,
) -> CoordinationResult<InceptionOutcome> {
    if let Some(existing) = existing_group(parties, &plan.group).await? {
        info!("group already incepted group={} prefix={}", plan.group, existing.prefix);
        return Ok(InceptionOutcome::Existing(existing));
    }
    let (initiator, joiners) = split_initiator(parties)?;
    let members = member_identifiers(parties).await?;
    let smids = plan.smids();

    let result = initiator
        .agent()
        .create_identifier(&plan.group, &plan.args(&initiator.member))
        .await
        .map_err(|e| CoordinationError::from(e).for_party(&initiator.name))?;
    let prefix = result.serder.prefix().to_string();
    let peers = recipients(&smids, &[&members[0].prefix]);
    send(initiator, &plan.group, &icp_message(plan, &result, peers.clone()))
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    let mut ledger = DeliveryLedger::new(peers.clone());
    ledger.mark_sent(&peers);
    info!("group inception submitted party={} group={} prefix={}", initiator.name, plan.group, prefix);

    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        join_inception(party, member, plan, policies)
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending = vec![(initiator, result.op)];
    pending.extend(joiners.iter().zip(joined));

    if let Some(delegator) = &plan.delpre {
        info!("group inception awaiting delegation group={} delegator={}", plan.group, delegator);
        return Ok(InceptionOutcome::AwaitingDelegation(PendingDelegation {
            group: plan.group.clone(),
            prefix,
            delegator: delegator.clone(),
            operations: pending
                .into_iter()
                .map(|(party, op)| (party.name.clone(), op))
                .collect(),
        }));
    }

    wait_all(pending, &policies.operation).await?;
    if !joiners.is_empty() {
        await_confirmations(initiator, Route::MultisigIcp, &mut ledger, &policies.mailbox)
            .await
            .map_err(|e| e.for_party(&initiator.name))?;
    }
    let group = converged_group(parties, &plan.group).await?;
    info!("group inception converged group={} prefix={}", plan.group, group.prefix);
    Ok(InceptionOutcome::Converged(group))
}

/// Waits until every member's agent has seen the delegator approve.
///
/// Every member refreshes the delegator's key state (optionally until
/// `until`) so its agent sees the anchoring event, then the pending
/// operations, named by party, are awaited.
pub(crate) async fn await_approval(
    parties: &[Party],
    delegator: &str,
    operations: Vec<(String, Operation)>,
    until: Option<u64>,
    policies: &Policies,
) -> CoordinationResult<()> {
    try_join_all(parties.iter().map(|party| async move {
        refresh(party, delegator, until, &policies.operation)
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let operations = operations
        .into_iter()
        .map(|(name, op)| {
            parties
                .iter()
                .find(|p| p.name == name)
                .map(|p| (p, op))
                .ok_or_else(|| CoordinationError::InvalidPlan(format!("unknown party {}", name)))
        })
        .collect::<CoordinationResult<Vec<_>>>()?;
    wait_all(operations, &policies.operation).await?;
    Ok(())
}

/// Finishes a delegated inception once the delegator has approved it.
/// Leftover `/multisig/icp` entries are removed.
pub async fn complete_delegation(
    parties: &[Party],
    pending: PendingDelegation,
    until: Option<u64>,
    policies: &Policies,
) -> CoordinationResult<Identifier> {
    await_approval(parties, &pending.delegator, pending.operations, until, policies).await?;
    for party in parties {
        if let Err(e) = wait_and_consume(party, Route::MultisigIcp, &RetryPolicy::once()).await {
            warn!("leftover inception notification not removed party={} error={}", party.name, e);
        }
    }
    let group = converged_group(parties, &pending.group).await?;
    info!("delegated group completed group={} prefix={}", pending.group, group.prefix);
    Ok(group)
}

/// OOBIs for the role on every party, if every party already has some.
async fn existing_oobis(parties: &[Party], plan: &EndRolePlan) -> CoordinationResult<Option<Vec<String>>> {
    let lists = try_join_all(parties.iter().map(|party| async move {
        party
            .agent()
            .oobis(&plan.group, &plan.role)
            .await
            .map_err(|e| CoordinationError::from(e).for_party(&party.name))
    }))
    .await?;
    if lists.iter().all(|oobis| !oobis.is_empty()) {
        Ok(lists.into_iter().next())
    } else {
        Ok(None)
    }
}

/// Submits one end-role reply per signing member agent and announces each.
async fn submit_end_roles(
    party: &Party,
    member: &Identifier,
    plan: &EndRolePlan,
) -> CoordinationResult<(Vec<Operation>, Vec<String>)> {
    let hab = party.identifier(&plan.group).await?;
    let members = party.agent().group_members(&plan.group).await?;
    let mut eids: Vec<String> = Vec::new();
    for eid in members
        .signing
        .iter()
        .filter_map(|m| m.ends.get(&plan.role))
        .flatten()
    {
        if !eids.contains(eid) {
            eids.push(eid.clone());
        }
    }
    let seal = SealEvent {
        i: hab.prefix.clone(),
        s: hab.state.ee.s.clone(),
        d: hab.state.ee.d.clone(),
    };
    let peers = recipients(&members.signing_prefixes(), &[&member.prefix]);

    let mut ops = Vec::with_capacity(eids.len());
    for eid in &eids {
        let result = party
            .agent()
            .add_end_role(&plan.group, &plan.role, eid, Some(&plan.stamp))
            .await?;
        let message = compose(
            Route::MultisigRpy,
            ExchangePayload::group(hab.prefix.clone()),
            [("rpy", embed(&result.serder, &result.sigs, Some(&seal)))],
            peers.clone(),
        );
        send(party, &plan.group, &message).await?;
        ops.push(result.op);
    }
    info!("end roles submitted party={} group={} eids={}", party.name, plan.group, eids.len());
    Ok((ops, peers))
}

/// Authorizes every signing member's agent for `plan.role` on the group and
/// returns the resulting OOBIs.
pub async fn authorize_end_roles(
    parties: &[Party],
    plan: &EndRolePlan,
    policies: &Policies,
) -> CoordinationResult<Vec<String>> {
    if let Some(oobis) = existing_oobis(parties, plan).await? {
        info!("end roles already authorized group={} role={}", plan.group, plan.role);
        return Ok(oobis);
    }
    let (initiator, joiners) = split_initiator(parties)?;
    let members = member_identifiers(parties).await?;

    let (initiator_ops, peers) = submit_end_roles(initiator, &members[0], plan)
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    let mut ledger = DeliveryLedger::new(peers.clone());
    ledger.mark_sent(&peers);

    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        let joined = async {
            wait_and_mark(party, Route::MultisigRpy, &policies.mailbox).await?;
            submit_end_roles(party, member, plan).await
        };
        joined.await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending: Vec<(&Party, Operation)> = initiator_ops.into_iter().map(|op| (initiator, op)).collect();
    for (party, (ops, _)) in joiners.iter().zip(joined) {
        pending.extend(ops.into_iter().map(|op| (party, op)));
    }
    wait_all(pending, &policies.operation).await?;
    if !joiners.is_empty() {
        await_confirmations(initiator, Route::MultisigRpy, &mut ledger, &policies.mailbox)
            .await
            .map_err(|e| e.for_party(&initiator.name))?;
    }

    let oobis = initiator.agent().oobis(&plan.group, &plan.role).await?;
    info!("end roles authorized group={} role={} oobis={}", plan.group, plan.role, oobis.len());
    Ok(oobis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::agent::IdentityAgent;
    use crate::error::AgentError;
    use crate::models::key_state::Threshold;
    use crate::services::testing::{fast_policies, group_of, incepted, plan_for};
    use tokio_test::{assert_err, assert_ok};

    fn count(network: &LocalNetwork, agent: &str, call: &str) -> usize {
        network
            .calls(agent)
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    #[tokio::test]
    async fn test_members_converge_on_one_prefix() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2", "qar3"]).await;
        let plan = plan_for(&parties, "qvi", Threshold::equal_weights(3)).await;

        let outcome = assert_ok!(incept_group(&parties, &plan, &fast_policies()).await);
        let group = match outcome {
            InceptionOutcome::Converged(group) => group,
            other => panic!("unexpected outcome {:?}", other),
        };
        for party in &parties {
            let hab = party.identifier("qvi").await.unwrap();
            assert_eq!(hab.prefix, group.prefix);
            assert!(hab.is_group());
        }
        let published = network.published_state(&group.prefix).unwrap().unwrap();
        assert_eq!(published.keys.len(), 3);
    }

    #[tokio::test]
    async fn test_joiner_never_submits_without_announcement() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let plan = plan_for(&parties, "qvi", Threshold::Count(2)).await;
        network.mute_mailbox("qar2", true).unwrap();

        let err = assert_err!(incept_group(&parties, &plan, &fast_policies()).await);
        assert!(matches!(err, CoordinationError::Party { ref party, .. } if party == "qar2"));
        assert!(matches!(err.root(), CoordinationError::NoMatchingNotification { attempts: 5, .. }));

        let calls = network.calls("qar2").unwrap();
        assert!(calls.iter().any(|c| c == "list_notifications"));
        assert_eq!(count(&network, "qar2", "create_identifier"), 1);
        // the only inception call is the member identifier created by the fixture
        assert_eq!(calls.iter().position(|c| c == "create_identifier"), Some(0));
    }

    #[tokio::test]
    async fn test_repeated_inception_submits_nothing() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2"], "qvi", Threshold::Count(2)).await;
        let plan = plan_for(&parties, "qvi", Threshold::Count(2)).await;
        let before = count(&network, "qar1", "create_identifier") + count(&network, "qar2", "create_identifier");

        let first = assert_ok!(incept_group(&parties, &plan, &fast_policies()).await);
        let second = assert_ok!(incept_group(&parties, &plan, &fast_policies()).await);
        assert_eq!(first, second);
        assert!(matches!(first, InceptionOutcome::Existing(_)));
        let after = count(&network, "qar1", "create_identifier") + count(&network, "qar2", "create_identifier");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_divergent_existing_groups_are_reported() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        // each member alone incepts a different single-member "qvi"
        for party in &parties {
            let solo = plan_for(std::slice::from_ref(party), "qvi", Threshold::Count(1)).await;
            incept_group(std::slice::from_ref(party), &solo, &fast_policies()).await.unwrap();
        }
        let plan = plan_for(&parties, "qvi", Threshold::Count(2)).await;
        let err = assert_err!(incept_group(&parties, &plan, &fast_policies()).await);
        assert!(matches!(err, CoordinationError::PeerDivergence { .. }));
    }

    #[tokio::test]
    async fn test_delegated_inception_completes_after_approval() {
        let network = LocalNetwork::new();
        let geda = group_of(&network, &["geda"]).await;
        let geda_prefix = geda[0].member_identifier().await.unwrap().prefix;
        let parties = group_of(&network, &["qar1", "qar2"]).await;
        let plan = plan_for(&parties, "qvi", Threshold::Count(2))
            .await
            .delegated_by(geda_prefix.clone());

        let pending = match assert_ok!(incept_group(&parties, &plan, &fast_policies()).await) {
            InceptionOutcome::AwaitingDelegation(pending) => pending,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(pending.delegator, geda_prefix);
        assert_eq!(pending.operations.len(), 2);

        let approved = network.approve_delegation(&pending.prefix).unwrap();
        let group = assert_ok!(complete_delegation(&parties, pending, Some(approved), &fast_policies()).await);
        assert_eq!(group.state.delegator(), Some(geda_prefix.as_str()));
        for party in &parties {
            let leftovers = party.agent().list_notifications().await.unwrap();
            assert!(leftovers.iter().all(|n| !n.is_unread_for(Route::MultisigIcp)));
        }
    }

    #[tokio::test]
    async fn test_end_roles_authorized_once() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2", "qar3"], "qvi", Threshold::Count(3)).await;
        let plan = EndRolePlan::agent_role("qvi");

        let oobis = assert_ok!(authorize_end_roles(&parties, &plan, &fast_policies()).await);
        assert_eq!(oobis.len(), 3);
        for party in &parties {
            assert_eq!(party.agent().oobis("qvi", "agent").await.unwrap().len(), 3);
        }

        let submitted = count(&network, "qar1", "add_end_role");
        assert_eq!(submitted, 3);
        let again = assert_ok!(authorize_end_roles(&parties, &plan, &fast_policies()).await);
        assert_eq!(again, oobis);
        assert_eq!(count(&network, "qar1", "add_end_role"), submitted);
    }

    #[tokio::test]
    async fn test_end_roles_for_unknown_group_fail() {
        let network = LocalNetwork::new();
        let parties = group_of(&network, &["qar1"]).await;
        let err = assert_err!(authorize_end_roles(&parties, &EndRolePlan::agent_role("nope"), &fast_policies()).await);
        assert!(matches!(err.root(), CoordinationError::Agent(AgentError::NotFound(_))));
    }
}
