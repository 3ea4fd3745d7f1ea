// src/main.rs

//! # Multisig Coordinator - Main Entry Point
//!
//! Drives one multisig group through its staged setup with every configured
//! party:
//! 1. **Inception**: the group identifier, completing a delegation if one is configured
//! 2. **End roles**: each member agent authorized as an `agent` endpoint
//! 3. **Registry**: the group's credential registry
//! 4. **Rotation** (when `MSIG__ROTATE=true`): member keys, then the group,
//!    waiting for the delegator's approval when the group is delegated
//!
//! Steps 1-3 are idempotent, so a run without rotation can simply be
//! restarted. Rotation is not: every run with `MSIG__ROTATE=true` rotates the
//! group once more. The result is printed as JSON.
//!
//! ## Configuration
//! - `MSIG_CONFIG`: settings file (default `coordinator.toml`)
//! - `MSIG__*`: overrides, e.g. `MSIG__MODE=local` for an in-process dry run
//! - `RUST_LOG`: log filter (default `info`)

use anyhow::{bail, Context, Result};
use log::info;
use multisig_coordinator::agent::http::HttpAgent;
use multisig_coordinator::agent::local::LocalNetwork;
use multisig_coordinator::agent::IdentityAgent;
use multisig_coordinator::config::{AgentMode, Settings};
use multisig_coordinator::models::identifier::{Identifier, InceptionArgs};
use multisig_coordinator::models::key_state::Threshold;
use multisig_coordinator::services::inception::{authorize_end_roles, complete_delegation, incept_group, InceptionOutcome};
use multisig_coordinator::services::issuance::create_registry;
use multisig_coordinator::services::key_state::{refresh_pairwise, Target};
use multisig_coordinator::services::plans::{EndRolePlan, GroupInceptionPlan, RegistryPlan};
use multisig_coordinator::services::rotation::{complete_rotation, rotate_group, RotationOutcome, RotationProgress};
use multisig_coordinator::services::{member_identifiers, Policies};
use multisig_coordinator::wallet::party::Party;
use serde::Serialize;
use std::sync::Arc;

/// What the run produced.
#[derive(Serialize, Debug)]
struct Report {
    group: String,
    prefix: String,
    sn: u64,
    oobis: Vec<String>,
    registry: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rotation: Option<String>,
}

/// Agents behind the configured parties. The local network is kept so a dry
/// run can approve its own delegations.
struct Agents {
    parties: Vec<Party>,
    local: Option<LocalNetwork>,
}

async fn connect(settings: &Settings) -> Result<Agents> {
    match settings.mode {
        AgentMode::Http => {
            let mut parties = Vec::with_capacity(settings.parties.len());
            for party in &settings.parties {
                let url = party
                    .url
                    .as_deref()
                    .with_context(|| format!("party {} has no agent url", party.name))?;
                let agent = HttpAgent::new(url, party.token.clone())
                    .with_context(|| format!("cannot reach agent of party {}", party.name))?;
                parties.push(Party::new(&party.name, &party.member, Arc::new(agent)));
            }
            Ok(Agents { parties, local: None })
        }
        AgentMode::Local => {
            let network = LocalNetwork::new();
            let mut parties = Vec::with_capacity(settings.parties.len());
            for party in &settings.parties {
                let agent = network.agent(&party.name)?;
                if agent.get_identifier(&party.member).await?.is_none() {
                    agent.create_identifier(&party.member, &InceptionArgs::default()).await?;
                }
                parties.push(Party::new(&party.name, &party.member, Arc::new(agent)));
            }
            Ok(Agents {
                parties,
                local: Some(network),
            })
        }
    }
}

async fn incept(agents: &Agents, settings: &Settings, policies: &Policies) -> Result<Identifier> {
    let parties = &agents.parties;
    let group = &settings.group;
    let targets: Vec<Target> = member_identifiers(parties)
        .await?
        .into_iter()
        .map(|member| Target::new(member.prefix, None))
        .collect();
    let states = refresh_pairwise(parties, &targets, &policies.operation)
        .await
        .context("member key states disagree")?;
    let members = states.len();
    let mut plan = GroupInceptionPlan::new(&group.name, states)?
        .with_thresholds(
            group.isith.as_ref().map_or(Threshold::Count(members as u64), Threshold::from),
            group.nsith.as_ref().map_or(Threshold::Count(members as u64), Threshold::from),
        )
        .with_witnesses(group.witnesses.clone(), group.toad);
    if let Some(delegator) = &group.delegator {
        plan = plan.delegated_by(delegator);
    }

    match incept_group(parties, &plan, policies).await? {
        InceptionOutcome::Existing(hab) | InceptionOutcome::Converged(hab) => Ok(hab),
        InceptionOutcome::AwaitingDelegation(pending) => {
            info!("waiting for delegator approval delegator={} prefix={}", pending.delegator, pending.prefix);
            let until = match &agents.local {
                Some(network) => Some(network.approve_delegation(&pending.prefix)?),
                None => None,
            };
            Ok(complete_delegation(parties, pending, until, policies).await?)
        }
    }
}

async fn rotate(agents: &Agents, name: &str, policies: &Policies) -> Result<RotationOutcome> {
    match rotate_group(&agents.parties, name, policies).await? {
        RotationProgress::Converged(outcome) => Ok(outcome),
        RotationProgress::AwaitingDelegation(pending) => {
            info!(
                "waiting for delegator approval delegator={} prefix={} sn={}",
                pending.delegation.delegator, pending.delegation.prefix, pending.sn
            );
            let until = match &agents.local {
                Some(network) => Some(network.approve_delegation(&pending.delegation.prefix)?),
                None => None,
            };
            Ok(complete_rotation(&agents.parties, pending, until, policies).await?)
        }
    }
}

async fn run(agents: &Agents, settings: &Settings) -> Result<Report> {
    let policies = settings.polling.policies();
    let parties = &agents.parties;
    let name = &settings.group.name;

    let hab = incept(agents, settings, &policies)
        .await
        .with_context(|| format!("inception of group {} failed", name))?;
    info!("group ready group={} prefix={}", name, hab.prefix);

    let oobis = authorize_end_roles(parties, &EndRolePlan::agent_role(name), &policies)
        .await
        .with_context(|| format!("end-role authorization of group {} failed", name))?;

    let registry = create_registry(parties, &RegistryPlan::new(name, &settings.group.registry), &policies)
        .await
        .with_context(|| format!("registry creation for group {} failed", name))?;

    let (sn, rotation) = if settings.rotate {
        let outcome = rotate(agents, name, &policies)
            .await
            .with_context(|| format!("rotation of group {} failed", name))?;
        (outcome.sn, Some(outcome.said))
    } else {
        (hab.sn(), None)
    };

    Ok(Report {
        group: name.clone(),
        prefix: hab.prefix,
        sn,
        oobis,
        registry: registry.regk,
        rotation,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("failed to load coordinator settings")?;
    if settings.parties.len() < 2 {
        bail!("a multisig group needs at least two parties");
    }
    let agents = connect(&settings).await?;
    info!("coordinating parties={} mode={:?}", agents.parties.len(), settings.mode);

    let report = run(&agents, &settings).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
