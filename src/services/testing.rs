// src/services/testing.rs
//! Fixtures for service tests: parties on a [`LocalNetwork`] and fast policies.

use crate::agent::local::LocalNetwork;
use crate::agent::IdentityAgent;
use crate::models::exchange::ExchangePayload;
use crate::models::identifier::InceptionArgs;
use crate::models::key_state::Threshold;
use crate::models::notification::Route;
use crate::services::exchange::{compose, send};
use crate::services::inception::{incept_group, InceptionOutcome};
use crate::services::key_state::{refresh_pairwise, Target};
use crate::services::plans::GroupInceptionPlan;
use crate::services::{member_identifiers, Policies};
use crate::utils::retry::RetryPolicy;
use crate::wallet::party::Party;
use std::sync::Arc;
use std::time::Duration;

pub(crate) fn quick(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::from_millis(1))
}

pub(crate) fn fast_policies() -> Policies {
    Policies {
        operation: quick(10),
        mailbox: quick(5),
        credential: quick(3),
    }
}

/// One party per name, each with a member identifier of the same name.
pub(crate) async fn group_of(network: &LocalNetwork, names: &[&str]) -> Vec<Party> {
    let mut parties = Vec::new();
    for name in names {
        let agent = network.agent(name).unwrap();
        agent
            .create_identifier(name, &InceptionArgs::default())
            .await
            .unwrap();
        parties.push(Party::new(*name, *name, Arc::new(agent)));
    }
    parties
}

/// Inception plan over the parties' fresh member states.
pub(crate) async fn plan_for(parties: &[Party], group: &str, isith: Threshold) -> GroupInceptionPlan {
    let targets: Vec<Target> = member_identifiers(parties)
        .await
        .unwrap()
        .into_iter()
        .map(|hab| Target::new(hab.prefix, None))
        .collect();
    let states = refresh_pairwise(parties, &targets, &quick(3)).await.unwrap();
    GroupInceptionPlan::new(group, states)
        .unwrap()
        .with_thresholds(isith.clone(), isith)
}

/// Parties with a converged group `group`.
pub(crate) async fn incepted(network: &LocalNetwork, names: &[&str], group: &str, isith: Threshold) -> Vec<Party> {
    let parties = group_of(network, names).await;
    let plan = plan_for(&parties, group, isith).await;
    match incept_group(&parties, &plan, &fast_policies()).await.unwrap() {
        InceptionOutcome::Converged(_) => parties,
        other => panic!("group did not converge: {:?}", other),
    }
}

/// `from` sends an empty `route` exchange to `to`'s member identifier.
pub(crate) async fn announce(from: &Party, to: &Party, route: Route) {
    let target = to.member_identifier().await.unwrap();
    let message = compose(
        route,
        ExchangePayload::group("EGroup"),
        std::iter::empty(),
        vec![target.prefix],
    );
    send(from, &from.member, &message).await.unwrap();
}
