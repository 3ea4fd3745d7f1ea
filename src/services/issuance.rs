// src/services/issuance.rs
//! Registry creation, credential issuance and the IPEX grant/admit handshake.
//!
//! Registry creation and issuance use the same rendezvous as inception: the
//! initiator submits and announces, joiners wait for the announcement, submit
//! the identical request and fan out their own signatures. Grants and admits
//! can be run by a group the same way over `/multisig/exn`.
//!
//! Credential visibility, not notifications, is the completion signal of an
//! admit. Notification marking around grants and admits is best-effort.

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::credential::{AdmitArgs, Credential, GrantArgs, IpexMessage, Registry};
use crate::models::event::{EventMessage, SealEvent};
use crate::models::exchange::{Embed, ExchangePayload};
use crate::models::identifier::Identifier;
use crate::models::notification::{Notification, Route};
use crate::models::operation::Operation;
use crate::services::exchange::{compose, embed, recipients, send, DeliveryLedger};
use crate::services::mailbox::{await_confirmations, mark_best_effort, mark_read, unread, wait_and_mark, wait_for};
use crate::services::operations::wait_all;
use crate::services::plans::{AdmitPlan, GrantPlan, IssuancePlan, RegistryPlan};
use crate::services::{member_identifiers, split_initiator, Policies};
use crate::utils::retry::{not_yet_visible, RetryPolicy};
use crate::wallet::party::Party;
use futures::future::try_join_all;
use log::{debug, info, warn};

/// How an admit step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// Every holder already had the credential; nothing was submitted.
    AlreadyAdmitted(Credential),
    Admitted(Credential),
    /// The admit was submitted but the credential is not visible yet.
    Submitted { grant: String },
    /// No grant has reached the holder yet; retry later.
    NotYetGranted,
}

fn signing_members(hab: &Identifier) -> Vec<String> {
    hab.group
        .as_ref()
        .map(|g| g.smids.clone())
        .unwrap_or_default()
}

fn establishment_seal(hab: &Identifier) -> SealEvent {
    SealEvent {
        i: hab.prefix.clone(),
        s: hab.state.ee.s.clone(),
        d: hab.state.ee.d.clone(),
    }
}

fn announced(embed: Option<&Embed>, label: &str, said: &str) -> CoordinationResult<EventMessage> {
    embed
        .map(|e| e.event.clone())
        .ok_or_else(|| CoordinationError::InvalidPlan(format!("exchange {} carries no {} event", said, label)))
}

fn ensure_same(context: String, expected: &str, found: &str) -> CoordinationResult<()> {
    if expected == found {
        return Ok(());
    }
    Err(CoordinationError::PeerDivergence {
        context,
        expected: expected.to_string(),
        found: found.to_string(),
    })
}

/// Ledger for an initiator that has just announced to `peers`.
fn sent_to(peers: &[String]) -> DeliveryLedger {
    let mut ledger = DeliveryLedger::new(peers.to_vec());
    ledger.mark_sent(peers);
    ledger
}

async fn confirm_initiator(
    initiator: &Party,
    route: Route,
    ledger: &mut DeliveryLedger,
    policies: &Policies,
) -> CoordinationResult<()> {
    if ledger.all_confirmed() {
        return Ok(());
    }
    await_confirmations(initiator, route, ledger, &policies.mailbox)
        .await
        .map_err(|e| e.for_party(&initiator.name))
}

// Registries

async fn find_registry(party: &Party, group: &str, name: &str) -> CoordinationResult<Option<Registry>> {
    let registries = party.agent().list_registries(group).await?;
    Ok(registries.into_iter().find(|r| r.name == name))
}

/// Submits the registry inception for one member and returns the registry
/// key with the operation.
async fn submit_registry(
    party: &Party,
    member: &Identifier,
    plan: &RegistryPlan,
) -> CoordinationResult<(String, Operation)> {
    let hab = party.identifier(&plan.group).await?;
    let result = party
        .agent()
        .create_registry(&plan.group, &plan.registry_name, &plan.nonce)
        .await?;
    let regk = result.regser.prefix().to_string();
    let message = compose(
        Route::MultisigVcp,
        ExchangePayload::group(hab.prefix.clone()),
        [
            ("vcp", embed(&result.regser, &[], None)),
            ("anc", embed(&result.anc, &result.sigs, None)),
        ],
        recipients(&signing_members(&hab), &[&member.prefix]),
    );
    send(party, &plan.group, &message).await?;
    Ok((regk, result.op))
}

/// Creates the credential registry named in `plan` for the group.
///
/// # Errors
/// - [`CoordinationError::RegistryNotFound`] if a member cannot list the
///   registry after its operation completed
/// - [`CoordinationError::PeerDivergence`] if members derive different registry keys
pub async fn create_registry(
    parties: &[Party],
    plan: &RegistryPlan,
    policies: &Policies,
) -> CoordinationResult<Registry> {
    let existing = try_join_all(parties.iter().map(|party| async move {
        find_registry(party, &plan.group, &plan.registry_name)
            .await
            .map_err(|e| e.for_party(&party.name))
    }))
    .await?;
    if let Some(Some(registry)) = existing.first() {
        if existing.iter().all(Option::is_some) {
            info!("registry already exists group={} registry={}", plan.group, registry.regk);
            return Ok(registry.clone());
        }
    }

    let (initiator, joiners) = split_initiator(parties)?;
    let members = member_identifiers(parties).await?;
    let (regk, op) = submit_registry(initiator, &members[0], plan)
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    let hab = initiator.identifier(&plan.group).await?;
    let mut ledger = sent_to(&recipients(&signing_members(&hab), &[&members[0].prefix]));
    info!("registry submitted party={} group={} registry={}", initiator.name, plan.group, regk);

    let expected = regk.as_str();
    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        let joined = async {
            let said = wait_and_mark(party, Route::MultisigVcp, &policies.mailbox).await?;
            let record = party.agent().get_exchange(&said).await?;
            let vcp = announced(record.message.embed("vcp"), "vcp", &said)?;
            ensure_same(format!("registry of group {}", plan.group), expected, vcp.prefix())?;
            let (regk, op) = submit_registry(party, member, plan).await?;
            ensure_same(format!("registry of group {}", plan.group), expected, &regk)?;
            Ok::<_, CoordinationError>(op)
        };
        joined.await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending = vec![(initiator, op)];
    pending.extend(joiners.iter().zip(joined));
    wait_all(pending, &policies.operation).await?;
    confirm_initiator(initiator, Route::MultisigVcp, &mut ledger, policies).await?;

    for party in parties {
        let registry = find_registry(party, &plan.group, &plan.registry_name)
            .await
            .map_err(|e| e.for_party(&party.name))?
            .ok_or_else(|| CoordinationError::RegistryNotFound(plan.group.clone()).for_party(&party.name))?;
        ensure_same(format!("registry seen by {}", party.name), &regk, &registry.regk)?;
    }
    info!("registry created group={} registry={}", plan.group, regk);
    Ok(Registry {
        name: plan.registry_name.clone(),
        regk,
    })
}

// Issuance

async fn submit_issuance(
    party: &Party,
    member: &Identifier,
    plan: &IssuancePlan,
) -> CoordinationResult<(String, Operation)> {
    let hab = party.identifier(&plan.group).await?;
    let result = party.agent().issue_credential(&plan.group, &plan.data).await?;
    let said = result.acdc.said().to_string();
    let message = compose(
        Route::MultisigIss,
        ExchangePayload::group(hab.prefix.clone()),
        [
            ("acdc", embed(&result.acdc, &[], None)),
            ("iss", embed(&result.iss, &[], None)),
            ("anc", embed(&result.anc, &result.sigs, None)),
        ],
        recipients(&signing_members(&hab), &[&member.prefix]),
    );
    send(party, &plan.group, &message).await?;
    Ok((said, result.op))
}

/// Issues the credential described by `plan` from the group.
///
/// Idempotent: when every member already lists a credential for the same
/// issuer, issuee and schema, that credential is returned and nothing is
/// submitted.
pub async fn issue_credential(
    parties: &[Party],
    plan: &IssuancePlan,
    policies: &Policies,
) -> CoordinationResult<Credential> {
    let issued = try_join_all(parties.iter().map(|party| async move {
        party
            .agent()
            .issued_credentials(plan.issuer(), plan.issuee(), plan.schema())
            .await
            .map_err(|e| CoordinationError::from(e).for_party(&party.name))
    }))
    .await?;
    if issued.iter().all(|found| !found.is_empty()) {
        if let Some(credential) = issued.into_iter().next().and_then(|found| found.into_iter().next()) {
            info!("credential already issued group={} said={}", plan.group, credential.said());
            return Ok(credential);
        }
    }

    let (initiator, joiners) = split_initiator(parties)?;
    let members = member_identifiers(parties).await?;
    let (said, op) = submit_issuance(initiator, &members[0], plan)
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    let hab = initiator.identifier(&plan.group).await?;
    let mut ledger = sent_to(&recipients(&signing_members(&hab), &[&members[0].prefix]));
    info!("issuance submitted party={} group={} said={}", initiator.name, plan.group, said);

    let expected = said.as_str();
    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        let joined = async {
            let exn = wait_and_mark(party, Route::MultisigIss, &policies.mailbox).await?;
            let record = party.agent().get_exchange(&exn).await?;
            let acdc = announced(record.message.embed("acdc"), "acdc", &exn)?;
            ensure_same(format!("issuance from {}", plan.group), expected, acdc.said())?;
            let (said, op) = submit_issuance(party, member, plan).await?;
            ensure_same(format!("issuance from {}", plan.group), expected, &said)?;
            Ok::<_, CoordinationError>(op)
        };
        joined.await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending = vec![(initiator, op)];
    pending.extend(joiners.iter().zip(joined));
    wait_all(pending, &policies.operation).await?;
    confirm_initiator(initiator, Route::MultisigIss, &mut ledger, policies).await?;

    let credential = wait_for_credential(initiator, &said, &policies.credential)
        .await
        .map_err(|e| e.for_party(&initiator.name))?
        .ok_or_else(|| not_yet_visible(&said))?;
    info!("credential issued group={} said={}", plan.group, said);
    Ok(credential)
}

/// Polls `party`'s store for `said` under `policy`, then tries one last
/// direct lookup instead of failing.
///
/// # Returns
/// `Ok(None)` if the credential is still not visible after the fallback.
pub async fn wait_for_credential(
    party: &Party,
    said: &str,
    policy: &RetryPolicy,
) -> CoordinationResult<Option<Credential>> {
    let polled = policy
        .execute(|attempt| async move {
            match party.agent().get_credential(said).await? {
                Some(credential) => Ok(credential),
                None => {
                    debug!("credential not visible party={} said={} attempt={}", party.name, said, attempt);
                    Err(not_yet_visible(said))
                }
            }
        })
        .await;
    match polled {
        Ok(credential) => Ok(Some(credential)),
        Err(CoordinationError::CredentialNotYetVisible { .. }) => {
            warn!("credential polling exhausted, trying direct lookup party={} said={}", party.name, said);
            Ok(party.agent().get_credential(said).await?)
        }
        Err(e) => Err(e),
    }
}

// Presentation

async fn announce_ipex(
    party: &Party,
    member: &Identifier,
    hab: &Identifier,
    message: &IpexMessage,
) -> CoordinationResult<()> {
    let exchange = compose(
        Route::MultisigExn,
        ExchangePayload::group(hab.prefix.clone()),
        [("exn", embed(&message.exn, &message.sigs, Some(&establishment_seal(hab))))],
        recipients(&signing_members(hab), &[&member.prefix]),
    );
    send(party, &hab.name, &exchange).await
}

/// Waits for a peer's `/multisig/exn` and returns the IPEX event it carries.
async fn await_ipex(party: &Party, policies: &Policies) -> CoordinationResult<EventMessage> {
    let said = wait_and_mark(party, Route::MultisigExn, &policies.mailbox).await?;
    let record = party.agent().get_exchange(&said).await?;
    announced(record.message.embed("exn"), "exn", &said)
}

async fn submit_grant(
    party: &Party,
    member: &Identifier,
    plan: &GrantPlan,
    credential: &Credential,
) -> CoordinationResult<(String, Operation)> {
    let hab = party.identifier(&plan.group).await?;
    let grant = party
        .agent()
        .grant(&GrantArgs {
            sender_name: plan.group.clone(),
            credential: credential.clone(),
            recipient: plan.recipient.clone(),
            datetime: plan.datetime.clone(),
        })
        .await?;
    let op = party
        .agent()
        .submit_grant(&plan.group, &grant, &[plan.recipient.clone()])
        .await?;
    announce_ipex(party, member, &hab, &grant).await?;
    Ok((grant.exn.said().to_string(), op))
}

/// Offers `credential` to `plan.recipient` from the issuing group and
/// returns the SAID of the grant exchange.
pub async fn grant_credential(
    parties: &[Party],
    plan: &GrantPlan,
    credential: &Credential,
    policies: &Policies,
) -> CoordinationResult<String> {
    let (initiator, joiners) = split_initiator(parties)?;
    let members = member_identifiers(parties).await?;
    let (said, op) = submit_grant(initiator, &members[0], plan, credential)
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    info!("grant submitted party={} credential={} recipient={}", initiator.name, credential.said(), plan.recipient);

    let expected = said.as_str();
    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        let joined = async {
            let exn = await_ipex(party, policies).await?;
            ensure_same(format!("grant of {}", credential.said()), expected, exn.said())?;
            let (said, op) = submit_grant(party, member, plan, credential).await?;
            ensure_same(format!("grant of {}", credential.said()), expected, &said)?;
            Ok::<_, CoordinationError>(op)
        };
        joined.await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending = vec![(initiator, op)];
    pending.extend(joiners.iter().zip(joined));
    wait_all(pending, &policies.operation).await?;
    for party in parties {
        mark_best_effort(party, Route::MultisigExn, &RetryPolicy::once()).await;
    }
    info!("credential granted credential={} grant={}", credential.said(), said);
    Ok(said)
}

/// SAID of the credential a grant exchange carries.
fn granted_credential(grant: &EventMessage) -> Option<String> {
    grant
        .ked()
        .pointer("/e/acdc/d")
        .and_then(|d| d.as_str())
        .map(String::from)
}

async fn submit_admit(
    party: &Party,
    member: &Identifier,
    plan: &AdmitPlan,
    grant_said: &str,
) -> CoordinationResult<(String, Operation)> {
    let hab = party.identifier(&plan.holder).await?;
    let admit = party
        .agent()
        .admit(&AdmitArgs {
            sender_name: plan.holder.clone(),
            grant_said: grant_said.to_string(),
            recipient: plan.issuer.clone(),
            datetime: plan.datetime.clone(),
            message: plan.message.clone(),
        })
        .await?;
    let op = party
        .agent()
        .submit_admit(&plan.holder, &admit, &[plan.issuer.clone()])
        .await?;
    announce_ipex(party, member, &hab, &admit).await?;
    Ok((admit.exn.said().to_string(), op))
}

/// The credential as held by the first holder, if every holder has it.
async fn held_by_all(holders: &[Party], said: &str) -> CoordinationResult<Option<Credential>> {
    let held = try_join_all(holders.iter().map(|party| async move {
        party
            .agent()
            .get_credential(said)
            .await
            .map_err(|e| CoordinationError::from(e).for_party(&party.name))
    }))
    .await?;
    if held.iter().all(Option::is_some) {
        Ok(held.into_iter().flatten().next())
    } else {
        Ok(None)
    }
}

/// Newest grant among `notes` that offers credential `said`.
async fn find_grant(party: &Party, notes: &[Notification], said: &str) -> CoordinationResult<Option<String>> {
    for note in notes.iter().rev() {
        let Some(grant_said) = note.exchange_said() else {
            continue;
        };
        let record = party.agent().get_exchange(grant_said).await?;
        match announced(record.message.embed("exn"), "exn", grant_said) {
            Ok(exn) if granted_credential(&exn).as_deref() == Some(said) => return Ok(Some(grant_said.to_string())),
            Ok(_) => debug!("grant offers another credential party={} grant={}", party.name, grant_said),
            Err(e) => warn!("unreadable grant party={} grant={} error={}", party.name, grant_said, e),
        }
    }
    Ok(None)
}

/// Marks `party`'s unread notifications of grant `grant_said` read.
async fn consume_grant(party: &Party, grant_said: &str) -> usize {
    match unread(party, Route::IpexGrant).await {
        Ok(notes) => {
            let matching: Vec<Notification> = notes
                .into_iter()
                .filter(|n| n.exchange_said() == Some(grant_said))
                .collect();
            mark_read(party, &matching).await
        }
        Err(e) => {
            warn!("grant notifications not listed party={} error={}", party.name, e);
            0
        }
    }
}

/// Admits `plan.credential` into the holder.
///
/// Returns [`AdmitOutcome::AlreadyAdmitted`] without touching the mailbox
/// when every holder already has the credential. Otherwise the first holder
/// waits for an `/exn/ipex/grant` offering it; further holders join through
/// `/multisig/exn`. No such grant yet is [`AdmitOutcome::NotYetGranted`].
pub async fn admit_credential(
    holders: &[Party],
    plan: &AdmitPlan,
    policies: &Policies,
) -> CoordinationResult<AdmitOutcome> {
    let (initiator, joiners) = split_initiator(holders)?;
    let said = plan.credential.as_str();
    if let Some(credential) = held_by_all(holders, said).await? {
        info!("credential already admitted party={} said={}", initiator.name, said);
        return Ok(AdmitOutcome::AlreadyAdmitted(credential));
    }

    let notes = match wait_for(initiator, Route::IpexGrant, &policies.mailbox).await {
        Ok(notes) => notes,
        Err(CoordinationError::NoMatchingNotification { attempts, .. }) => {
            info!("no grant received party={} attempts={}", initiator.name, attempts);
            return Ok(AdmitOutcome::NotYetGranted);
        }
        Err(e) => return Err(e.for_party(&initiator.name)),
    };
    let Some(grant_said) = find_grant(initiator, &notes, said)
        .await
        .map_err(|e| e.for_party(&initiator.name))?
    else {
        info!("no grant of credential received party={} said={}", initiator.name, said);
        return Ok(AdmitOutcome::NotYetGranted);
    };

    let members = member_identifiers(holders).await?;
    let (admit_said, op) = submit_admit(initiator, &members[0], plan, &grant_said)
        .await
        .map_err(|e| e.for_party(&initiator.name))?;
    info!("admit submitted party={} grant={}", initiator.name, grant_said);

    let expected = admit_said.as_str();
    let joined = try_join_all(joiners.iter().zip(&members[1..]).map(|(party, member)| async move {
        let joined = async {
            let exn = await_ipex(party, policies).await?;
            let granted = exn.ked().get("p").and_then(|p| p.as_str()).unwrap_or_default().to_string();
            let (said, op) = submit_admit(party, member, plan, &granted).await?;
            ensure_same(format!("admit of {}", granted), expected, &said)?;
            Ok::<_, CoordinationError>(op)
        };
        joined.await.map_err(|e| e.for_party(&party.name))
    }))
    .await?;

    let mut pending = vec![(initiator, op)];
    pending.extend(joiners.iter().zip(joined));
    wait_all(pending, &policies.operation).await?;
    for party in holders {
        consume_grant(party, &grant_said).await;
        mark_best_effort(party, Route::MultisigExn, &RetryPolicy::once()).await;
    }

    match wait_for_credential(initiator, said, &policies.credential).await {
        Ok(Some(credential)) => {
            info!("credential admitted party={} said={}", initiator.name, said);
            Ok(AdmitOutcome::Admitted(credential))
        }
        Ok(None) => Ok(AdmitOutcome::Submitted { grant: grant_said }),
        Err(e) => Err(e.for_party(&initiator.name)),
    }
}

/// Best-effort consumption of admit notifications at the issuers; returns
/// how many issuers had one.
pub async fn acknowledge_admits(issuers: &[Party]) -> usize {
    let mut acknowledged = 0;
    for party in issuers {
        if mark_best_effort(party, Route::IpexAdmit, &RetryPolicy::once()).await.is_some() {
            acknowledged += 1;
        }
    }
    acknowledged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::local::LocalNetwork;
    use crate::models::key_state::Threshold;
    use crate::services::testing::{fast_policies, group_of, incepted, quick};
    use serde_json::{json, Map, Value};
    use tokio_test::{assert_err, assert_ok};

    const SCHEMA: &str = "EBfdlu8R27Fbx-ehrqwImnK-8Cm79sqbAQ4MmvEAYqao";

    fn count(network: &LocalNetwork, agent: &str, call: &str) -> usize {
        network
            .calls(agent)
            .unwrap()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }

    fn attributes() -> Map<String, Value> {
        match json!({"LEI": "5493001KJTIIGC8Y1R17"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    struct Issued {
        issuers: Vec<Party>,
        holders: Vec<Party>,
        credential: Credential,
    }

    async fn issued(network: &LocalNetwork) -> Issued {
        let holders = group_of(network, &["holder"]).await;
        let holder = holders[0].member_identifier().await.unwrap().prefix;
        issued_to(network, holders, holder).await
    }

    async fn issued_to(network: &LocalNetwork, holders: Vec<Party>, holder: String) -> Issued {
        let issuers = incepted(network, &["qar1", "qar2"], "qvi", Threshold::Count(2)).await;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;

        let registry = create_registry(&issuers, &RegistryPlan::new("qvi", "vLEI"), &fast_policies())
            .await
            .unwrap();
        let plan = IssuancePlan::new("qvi", gid, registry.regk, SCHEMA, holder, attributes(), None, None);
        let credential = issue_credential(&issuers, &plan, &fast_policies()).await.unwrap();
        Issued {
            issuers,
            holders,
            credential,
        }
    }

    #[tokio::test]
    async fn test_registry_created_once() {
        let network = LocalNetwork::new();
        let parties = incepted(&network, &["qar1", "qar2", "qar3"], "qvi", Threshold::Count(3)).await;
        let plan = RegistryPlan::new("qvi", "vLEI");

        let registry = assert_ok!(create_registry(&parties, &plan, &fast_policies()).await);
        assert_eq!(registry.name, "vLEI");
        for party in &parties {
            let listed = party.agent().list_registries("qvi").await.unwrap();
            assert_eq!(listed, vec![registry.clone()]);
        }

        let again = assert_ok!(create_registry(&parties, &plan, &fast_policies()).await);
        assert_eq!(again, registry);
        assert_eq!(count(&network, "qar2", "create_registry"), 1);
    }

    #[tokio::test]
    async fn test_issuance_is_idempotent() {
        let network = LocalNetwork::new();
        let Issued {
            issuers, credential, ..
        } = issued(&network).await;
        assert_eq!(credential.sad.subject.attributes["LEI"], "5493001KJTIIGC8Y1R17");

        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        let plan = IssuancePlan::new(
            "qvi",
            gid,
            credential.sad.registry.clone(),
            SCHEMA,
            credential.issuee(),
            attributes(),
            None,
            None,
        );
        let again = assert_ok!(issue_credential(&issuers, &plan, &fast_policies()).await);
        assert_eq!(again.said(), credential.said());
        assert_eq!(count(&network, "qar1", "issue_credential"), 1);
        assert_eq!(count(&network, "qar2", "issue_credential"), 1);
    }

    #[tokio::test]
    async fn test_issuance_needs_registry() {
        let network = LocalNetwork::new();
        let issuers = incepted(&network, &["qar1"], "qvi", Threshold::Count(1)).await;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        let plan = IssuancePlan::new("qvi", gid, "EMissingRegistry", SCHEMA, "EHolder", attributes(), None, None);
        let err = assert_err!(issue_credential(&issuers, &plan, &fast_policies()).await);
        assert!(matches!(err.root(), CoordinationError::Agent(_)));
    }

    #[tokio::test]
    async fn test_grant_then_admit() {
        let network = LocalNetwork::new();
        let Issued {
            issuers,
            holders,
            credential,
        } = issued(&network).await;
        let holder = holders[0].member_identifier().await.unwrap().prefix;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;

        let grant = assert_ok!(
            grant_credential(&issuers, &GrantPlan::new("qvi", holder), &credential, &fast_policies()).await
        );
        let plan = AdmitPlan::new("holder", gid, credential.said());
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        match outcome {
            AdmitOutcome::Admitted(held) => assert_eq!(held.said(), credential.said()),
            other => panic!("unexpected outcome {:?} for grant {}", other, grant),
        }
        assert_eq!(acknowledge_admits(&issuers).await, 2);
        assert_eq!(acknowledge_admits(&issuers).await, 0);
    }

    #[tokio::test]
    async fn test_admit_before_grant() {
        let network = LocalNetwork::new();
        let Issued {
            issuers,
            holders,
            credential,
        } = issued(&network).await;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;

        let plan = AdmitPlan::new("holder", gid, credential.said());
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert_eq!(outcome, AdmitOutcome::NotYetGranted);
        assert_eq!(count(&network, "holder", "admit"), 0);
    }

    #[tokio::test]
    async fn test_admit_falls_back_to_direct_lookup() {
        let network = LocalNetwork::new();
        let Issued {
            issuers,
            holders,
            credential,
        } = issued(&network).await;
        let holder = holders[0].member_identifier().await.unwrap().prefix;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        grant_credential(&issuers, &GrantPlan::new("qvi", holder), &credential, &fast_policies())
            .await
            .unwrap();

        // held check plus every poll find nothing; only the fallback sees it
        network.hide_credentials("holder", 4).unwrap();
        let plan = AdmitPlan::new("holder", gid, credential.said());
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(outcome, AdmitOutcome::Admitted(_)));
        assert_eq!(count(&network, "holder", "get_credential"), 5);
    }

    #[tokio::test]
    async fn test_repeated_admit_reports_existing() {
        let network = LocalNetwork::new();
        let Issued {
            issuers,
            holders,
            credential,
        } = issued(&network).await;
        let holder = holders[0].member_identifier().await.unwrap().prefix;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        grant_credential(&issuers, &GrantPlan::new("qvi", holder), &credential, &fast_policies())
            .await
            .unwrap();
        let plan = AdmitPlan::new("holder", gid, credential.said());
        let first = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(first, AdmitOutcome::Admitted(_)));
        let listings = count(&network, "holder", "list_notifications");

        // no new grant: the holder's copy alone settles it
        let again = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(again, AdmitOutcome::AlreadyAdmitted(ref held) if held.said() == credential.said()));
        assert_eq!(count(&network, "holder", "admit"), 1);
        assert_eq!(count(&network, "holder", "list_notifications"), listings);
    }

    #[tokio::test]
    async fn test_grant_of_another_credential_is_not_admitted() {
        let network = LocalNetwork::new();
        let Issued {
            issuers,
            holders,
            credential,
        } = issued(&network).await;
        let holder = holders[0].member_identifier().await.unwrap().prefix;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        grant_credential(&issuers, &GrantPlan::new("qvi", holder), &credential, &fast_policies())
            .await
            .unwrap();

        let plan = AdmitPlan::new("holder", gid.clone(), "EOtherCredential");
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert_eq!(outcome, AdmitOutcome::NotYetGranted);
        assert_eq!(count(&network, "holder", "admit"), 0);

        // the offer of the real credential is still there
        let plan = AdmitPlan::new("holder", gid, credential.said());
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(outcome, AdmitOutcome::Admitted(_)));
    }

    #[tokio::test]
    async fn test_group_holder_admits_and_consumes_grants() {
        let network = LocalNetwork::new();
        let holders = incepted(&network, &["le1", "le2"], "le", Threshold::Count(2)).await;
        let le = holders[0].identifier("le").await.unwrap().prefix;
        let Issued {
            issuers,
            holders,
            credential,
        } = issued_to(&network, holders, le.clone()).await;
        let gid = issuers[0].identifier("qvi").await.unwrap().prefix;
        grant_credential(&issuers, &GrantPlan::new("qvi", le), &credential, &fast_policies())
            .await
            .unwrap();

        // a failed mark is logged, never fatal
        network.fail_marking("le1", true).unwrap();
        let plan = AdmitPlan::new("le", gid, credential.said());
        let outcome = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(outcome, AdmitOutcome::Admitted(ref held) if held.said() == credential.said()));
        assert_eq!(count(&network, "le1", "admit"), 1);
        assert_eq!(count(&network, "le2", "admit"), 1);
        for party in &holders {
            assert!(party.agent().get_credential(credential.said()).await.unwrap().is_some());
        }
        assert_eq!(unread(&holders[0], Route::IpexGrant).await.unwrap().len(), 1);
        assert!(unread(&holders[1], Route::IpexGrant).await.unwrap().is_empty());

        network.fail_marking("le1", false).unwrap();
        let again = assert_ok!(admit_credential(&holders, &plan, &fast_policies()).await);
        assert!(matches!(again, AdmitOutcome::AlreadyAdmitted(_)));
        assert_eq!(count(&network, "le1", "admit"), 1);
    }

    #[tokio::test]
    async fn test_wait_for_credential_fallback() {
        let network = LocalNetwork::new();
        let Issued {
            issuers, credential, ..
        } = issued(&network).await;

        network.hide_credentials("qar1", 3).unwrap();
        let found = assert_ok!(wait_for_credential(&issuers[0], credential.said(), &quick(3)).await);
        assert_eq!(found.map(|c| c.said().to_string()), Some(credential.said().to_string()));

        let missing = assert_ok!(wait_for_credential(&issuers[0], "EUnknown", &quick(2)).await);
        assert!(missing.is_none());
    }
}
