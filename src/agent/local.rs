// src/agent/local.rs
//! In-process identity agents sharing one simulated network.
//!
//! [`LocalNetwork`] stands in for a set of remote agents plus their witnesses:
//! every party gets a [`LocalAgent`] handle with its own identifiers, key
//! chain, operations and mailbox, while accepted key states, exchange
//! messages, registries and issued credentials live in shared tables.
//!
//! Multi-signature events collect member signatures in an escrow keyed by the
//! event's intent (what is being rotated, anchored or sent). A late member
//! that submits identical parameters signs the escrowed event rather than
//! building a new one, and the event takes effect once its signing threshold
//! is met. Submissions whose member key states are not current are rejected.
//!
//! # Test hooks
//! - [`LocalNetwork::mute_mailbox`] makes a mailbox list nothing
//! - [`LocalNetwork::calls`] returns the ordered trait calls an agent received
//! - [`LocalNetwork::refuse_rotation`] makes one identifier's rotation fail
//! - [`LocalNetwork::hide_credentials`] hides credential lookups for a while
//! - [`LocalNetwork::approve_delegation`] anchors a delegated inception

use crate::agent::{AgentResult, IdentityAgent};
use crate::error::AgentError;
use crate::models::credential::{
    Acdc, AdmitArgs, Credential, CredentialData, GrantArgs, IpexMessage, IssuanceResult, Registry,
    RegistryResult,
};
use crate::models::event::{EventMessage, EventResult};
use crate::models::exchange::{Embed, ExchangeMessage, ExchangePayload, ExchangeRecord};
use crate::models::identifier::{
    Algo, GroupMember, GroupMembers, GroupRecord, Identifier, InceptionArgs, RotationArgs,
};
use crate::models::key_state::{EstablishmentEvent, KeyState, Threshold};
use crate::models::notification::{Notification, NotificationAttrs, Route};
use crate::models::operation::Operation;
use crate::utils::crypto::digest_qb64;
use crate::utils::timestamp;
use crate::wallet::key_management::KeyManager;
use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

const KERI_VERSION: &str = "KERI10JSON000000_";
const ACDC_VERSION: &str = "ACDC10JSON000000_";
const OOBI_HOST: &str = "http://127.0.0.1:3902";

/// Shared state of all simulated agents.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

/// One party's view onto a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalAgent {
    network: LocalNetwork,
    id: String,
}

#[derive(Default)]
struct NetworkState {
    agents: BTreeMap<String, AgentState>,
    /// Accepted key state per prefix
    kels: HashMap<String, KeyState>,
    escrows: HashMap<String, Escrow>,
    exchanges: HashMap<String, ExchangeRecord>,
    registries: HashMap<String, Vec<Registry>>,
    issued: Vec<Credential>,
    /// Credential offered by each grant exchange
    grants: HashMap<String, Credential>,
    end_roles: HashMap<(String, String), BTreeSet<String>>,
    /// Delegator sequence number that approved each delegated (prefix, sn)
    delegations: HashMap<(String, u64), u64>,
    counter: u64,
}

struct AgentState {
    seed: String,
    agent_prefix: String,
    identifiers: BTreeMap<String, Identifier>,
    key_index: HashMap<String, u64>,
    operations: HashMap<String, PendingOp>,
    notifications: Vec<Notification>,
    held: BTreeMap<String, Credential>,
    known_states: HashMap<String, KeyState>,
    calls: Vec<String>,
    muted: bool,
    /// Marking notifications read fails while set
    marks_fail: bool,
    hidden_lookups: u32,
    refused_rotations: HashSet<String>,
}

#[derive(Clone)]
enum PendingOp {
    Escrow {
        intent: String,
    },
    Delegated {
        intent: String,
        delegate: String,
        delegator: String,
        /// Sequence number of the delegated establishment event
        sn: u64,
    },
    Query {
        prefix: String,
        sn: Option<u64>,
    },
}

struct Escrow {
    event: EventMessage,
    threshold: Threshold,
    signers: BTreeSet<usize>,
    effect: Effect,
    applied: bool,
}

#[derive(Clone)]
struct Effect {
    publish: Option<KeyState>,
    action: Action,
}

#[derive(Clone)]
enum Action {
    None,
    EndRole {
        prefix: String,
        role: String,
        eid: String,
    },
    Registry {
        prefix: String,
        registry: Registry,
    },
    Issue(Credential),
    Deliver {
        record: ExchangeRecord,
        admitted: Option<(String, Credential)>,
    },
}

/// Who signs for an identifier and how many signatures it needs.
struct Signer {
    identifier: Identifier,
    name: String,
    position: usize,
    threshold: Threshold,
}

/// Parameters of an establishment (inception or rotation) event.
struct Establishment<'a> {
    ilk: &'a str,
    /// `None` for a self-addressing inception
    prefix: Option<&'a str>,
    sn: u64,
    prior: Option<&'a str>,
    kt: Threshold,
    keys: Vec<String>,
    nt: Threshold,
    next: Vec<String>,
    toad: u64,
    wits: Vec<String>,
    delegator: Option<&'a str>,
}

fn rejected(msg: impl Into<String>) -> AgentError {
    AgentError::Rejected(msg.into())
}

/// Sets `d` (and `i` for self-addressing prefixes) to the digest of the body.
fn saidify(mut ked: Value, prefixed: bool) -> AgentResult<EventMessage> {
    let placeholder = Value::String("#".repeat(44));
    ked["d"] = placeholder.clone();
    if prefixed {
        ked["i"] = placeholder;
    }
    let said = digest_qb64(serde_json::to_string(&ked)?.as_bytes());
    ked["d"] = Value::String(said.clone());
    if prefixed {
        ked["i"] = Value::String(said);
    }
    Ok(EventMessage::new(ked)?)
}

fn establish(params: Establishment<'_>) -> AgentResult<(EventMessage, KeyState)> {
    let sn = format!("{:x}", params.sn);
    let toad = format!("{:x}", params.toad);
    let mut ked = json!({
        "v": KERI_VERSION,
        "t": params.ilk,
        "d": "",
        "i": params.prefix.unwrap_or_default(),
        "s": sn,
        "kt": params.kt,
        "k": params.keys,
        "nt": params.nt,
        "n": params.next,
        "bt": toad,
        "b": params.wits,
        "c": [],
        "a": [],
    });
    if let Some(prior) = params.prior {
        ked["p"] = json!(prior);
    }
    if let Some(delegator) = params.delegator.filter(|_| params.sn == 0) {
        ked["di"] = json!(delegator);
    }
    let event = saidify(ked, params.prefix.is_none())?;
    let state = KeyState {
        prefix: event.prefix().to_string(),
        sequence: sn.clone(),
        digest: event.said().to_string(),
        keys: params.keys,
        next_digests: params.next,
        signing_threshold: params.kt,
        next_threshold: params.nt,
        witnesses: params.wits,
        witness_threshold: toad,
        delegator: params.delegator.unwrap_or_default().to_string(),
        ee: EstablishmentEvent {
            s: sn,
            d: event.said().to_string(),
        },
    };
    Ok((event, state))
}

/// Interaction event anchoring `seals` on top of `prior`.
fn interact(prior: &KeyState, seals: Value) -> AgentResult<(EventMessage, KeyState)> {
    let sn = format!("{:x}", prior.sn() + 1);
    let ked = json!({
        "v": KERI_VERSION,
        "t": "ixn",
        "d": "",
        "i": prior.prefix,
        "s": sn,
        "p": prior.digest,
        "a": seals,
    });
    let event = saidify(ked, false)?;
    let mut state = prior.clone();
    state.sequence = sn;
    state.digest = event.said().to_string();
    Ok((event, state))
}

fn exchange_event(
    sender: &str,
    recipient: &str,
    route: &str,
    prior: &str,
    datetime: &str,
    attrs: Value,
    embeds: Value,
) -> AgentResult<EventMessage> {
    saidify(
        json!({
            "v": KERI_VERSION,
            "t": "exn",
            "d": "",
            "i": sender,
            "rp": recipient,
            "p": prior,
            "dt": datetime,
            "r": route,
            "q": {},
            "a": attrs,
            "e": embeds,
        }),
        false,
    )
}

fn credential_from_grant(exn: &EventMessage) -> AgentResult<Credential> {
    let embeds = exn
        .ked()
        .get("e")
        .ok_or_else(|| rejected("grant carries no embeds"))?;
    let part = |label: &str| {
        embeds
            .get(label)
            .cloned()
            .ok_or_else(|| rejected(format!("grant carries no {} embed", label)))
    };
    Ok(Credential {
        sad: serde_json::from_value::<Acdc>(part("acdc")?)?,
        iss: EventMessage::new(part("iss")?)?,
        anc: EventMessage::new(part("anc")?)?,
        ancatc: String::new(),
    })
}

impl Escrow {
    fn new(event: EventMessage, threshold: Threshold, effect: Effect) -> Self {
        Self {
            event,
            threshold,
            signers: BTreeSet::new(),
            effect,
            applied: false,
        }
    }
}

impl AgentState {
    fn new(id: &str, seed: &str) -> Self {
        Self {
            seed: seed.to_string(),
            agent_prefix: digest_qb64(format!("agent:{}", id).as_bytes()),
            identifiers: BTreeMap::new(),
            key_index: HashMap::new(),
            operations: HashMap::new(),
            notifications: Vec::new(),
            held: BTreeMap::new(),
            known_states: HashMap::new(),
            calls: Vec::new(),
            muted: false,
            marks_fail: false,
            hidden_lookups: 0,
            refused_rotations: HashSet::new(),
        }
    }

    fn keys_for(&self, name: &str) -> KeyManager {
        KeyManager::new(format!("{}/{}", self.seed, name))
    }

    fn holds(&self, prefix: &str) -> bool {
        self.identifiers.values().any(|hab| hab.prefix == prefix)
    }
}

impl NetworkState {
    fn agent(&self, id: &str) -> AgentResult<&AgentState> {
        self.agents
            .get(id)
            .ok_or_else(|| AgentError::NotFound(format!("agent {}", id)))
    }

    fn agent_mut(&mut self, id: &str) -> AgentResult<&mut AgentState> {
        self.agents
            .get_mut(id)
            .ok_or_else(|| AgentError::NotFound(format!("agent {}", id)))
    }

    fn next_name(&mut self, kind: &str) -> String {
        self.counter += 1;
        format!("{}.{}", kind, self.counter)
    }

    /// The identifier with its accepted key state, if any was published.
    fn resolved(&self, hab: &Identifier) -> Identifier {
        let mut hab = hab.clone();
        if let Some(state) = self.kels.get(&hab.prefix) {
            hab.state = state.clone();
        }
        hab
    }

    fn identifier(&self, agent: &str, name: &str) -> AgentResult<Identifier> {
        self.agent(agent)?
            .identifiers
            .get(name)
            .map(|hab| self.resolved(hab))
            .ok_or_else(|| AgentError::NotFound(format!("identifier {}", name)))
    }

    fn signer(&self, agent: &str, name: &str) -> AgentResult<Signer> {
        let identifier = self.identifier(agent, name)?;
        let threshold = identifier.state.signing_threshold.clone();
        match identifier.group.clone() {
            Some(group) => {
                let member = self.identifier(agent, &group.mhab)?;
                let position = group
                    .smids
                    .iter()
                    .position(|smid| *smid == member.prefix)
                    .ok_or_else(|| rejected(format!("{} is not a signing member of {}", group.mhab, name)))?;
                Ok(Signer {
                    name: group.mhab,
                    identifier,
                    position,
                    threshold,
                })
            }
            None => Ok(Signer {
                name: name.to_string(),
                identifier,
                position: 0,
                threshold,
            }),
        }
    }

    /// Every snapshot must describe the accepted state of its identifier.
    fn check_fresh(&self, states: &[KeyState]) -> AgentResult<()> {
        for state in states {
            match self.kels.get(&state.prefix) {
                Some(current) if current.same_event(state) => {}
                Some(current) => {
                    return Err(rejected(format!(
                        "stale key state for {}: sn {} but accepted sn is {}",
                        state.prefix,
                        state.sn(),
                        current.sn()
                    )))
                }
                None => return Err(AgentError::NotFound(format!("key state {}", state.prefix))),
            }
        }
        Ok(())
    }

    /// Adds `signer`'s signature to the escrowed event for `intent`, creating
    /// the escrow from `fresh` when this is the first submission.
    fn endorse<F>(
        &mut self,
        agent: &str,
        signer: &str,
        position: usize,
        intent: &str,
        fresh: F,
    ) -> AgentResult<(EventMessage, Vec<String>)>
    where
        F: FnOnce(&NetworkState) -> AgentResult<Escrow>,
    {
        if !self.escrows.contains_key(intent) {
            let escrow = fresh(&*self)?;
            self.escrows.insert(intent.to_string(), escrow);
        }
        let owner = self.agent(agent)?;
        let index = owner.key_index.get(signer).copied().unwrap_or_default();
        let keys = owner.keys_for(signer);
        let escrow = self
            .escrows
            .get_mut(intent)
            .ok_or_else(|| AgentError::NotFound(format!("escrow {}", intent)))?;
        let sig = keys.sign_indexed(index, position, escrow.event.raw().as_bytes())?;
        escrow.signers.insert(position);
        let signers: Vec<usize> = escrow.signers.iter().copied().collect();
        let satisfied = escrow.threshold.is_satisfied(&signers);
        let event = escrow.event.clone();
        debug!(
            "escrow_signed intent={} signer={} signatures={} satisfied={}",
            intent,
            signer,
            signers.len(),
            satisfied
        );
        if satisfied {
            self.apply(intent);
        }
        Ok((event, vec![sig]))
    }

    fn apply(&mut self, intent: &str) {
        let effect = match self.escrows.get_mut(intent) {
            Some(escrow) if !escrow.applied => {
                escrow.applied = true;
                escrow.effect.clone()
            }
            _ => return,
        };
        if let Some(state) = effect.publish {
            debug!("key_state_accepted prefix={} sn={}", state.prefix, state.sn());
            self.kels.insert(state.prefix.clone(), state);
        }
        match effect.action {
            Action::None => {}
            Action::EndRole { prefix, role, eid } => {
                self.end_roles.entry((prefix, role)).or_default().insert(eid);
            }
            Action::Registry { prefix, registry } => {
                let registries = self.registries.entry(prefix).or_default();
                if !registries.iter().any(|r| r.regk == registry.regk) {
                    registries.push(registry);
                }
            }
            Action::Issue(credential) => {
                if !self.issued.iter().any(|c| c.said() == credential.said()) {
                    self.issued.push(credential);
                }
            }
            Action::Deliver { record, admitted } => {
                if let Some((holder, credential)) = admitted {
                    for agent in self.agents.values_mut().filter(|a| a.holds(&holder)) {
                        agent
                            .held
                            .insert(credential.said().to_string(), credential.clone());
                    }
                }
                let route = record.message.route;
                let said = record.said.clone();
                let recipients = record.message.recipients.clone();
                self.exchanges.insert(said.clone(), record);
                for recipient in recipients {
                    self.notify(&recipient, route, &said);
                }
            }
        }
    }

    /// Raises a notification in every agent that holds `recipient`.
    fn notify(&mut self, recipient: &str, route: Route, said: &str) -> usize {
        let mut delivered = 0;
        for agent in self.agents.values_mut().filter(|a| a.holds(recipient)) {
            self.counter += 1;
            agent.notifications.push(Notification {
                i: format!("note.{}", self.counter),
                dt: timestamp(),
                r: false,
                a: NotificationAttrs {
                    r: route.as_str().to_string(),
                    d: Some(said.to_string()),
                    m: None,
                },
            });
            delivered += 1;
        }
        delivered
    }

    fn track(&mut self, agent: &str, kind: &str, pending: PendingOp) -> AgentResult<Operation> {
        let name = self.next_name(kind);
        self.agent_mut(agent)?
            .operations
            .insert(name.clone(), pending);
        self.poll(agent, &name)
    }

    fn poll(&mut self, agent: &str, name: &str) -> AgentResult<Operation> {
        let pending = self
            .agent(agent)?
            .operations
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("operation {}", name)))?;
        let applied = |intent: &str| self.escrows.get(intent).filter(|e| e.applied);
        let op = match pending {
            PendingOp::Escrow { intent } => match applied(&intent) {
                Some(escrow) => Operation::completed(name, escrow.event.ked().clone()),
                None => Operation::pending(name),
            },
            PendingOp::Delegated {
                intent,
                delegate,
                delegator,
                sn,
            } => {
                let approved = self.delegations.get(&(delegate, sn)).copied();
                let seen = self
                    .agent(agent)?
                    .known_states
                    .get(&delegator)
                    .map(KeyState::sn);
                match (applied(&intent), approved, seen) {
                    (Some(escrow), Some(approval), Some(seen)) if seen >= approval => {
                        Operation::completed(name, escrow.event.ked().clone())
                    }
                    _ => Operation::pending(name),
                }
            }
            PendingOp::Query { prefix, sn } => match self.kels.get(&prefix).cloned() {
                None => Operation::failed(name, 404, format!("unknown prefix {}", prefix)),
                Some(state) if sn.map_or(true, |wanted| state.sn() >= wanted) => {
                    let response = serde_json::to_value(&state)?;
                    self.agent_mut(agent)?.known_states.insert(prefix, state);
                    Operation::completed(name, response)
                }
                Some(_) => Operation::pending(name),
            },
        };
        Ok(op)
    }

    fn incept_single(&mut self, agent: &str, name: &str, args: &InceptionArgs) -> AgentResult<EventResult> {
        let keys = self.agent(agent)?.keys_for(name);
        let (event, state) = establish(Establishment {
            ilk: "icp",
            prefix: None,
            sn: 0,
            prior: None,
            kt: Threshold::Count(1),
            keys: vec![keys.public_key_qb64(0)?],
            nt: Threshold::Count(1),
            next: vec![keys.next_digest(0)?],
            toad: args.toad,
            wits: args.wits.clone(),
            delegator: None,
        })?;
        let hab = Identifier {
            name: name.to_string(),
            prefix: event.prefix().to_string(),
            state: state.clone(),
            group: None,
        };
        let owner = self.agent_mut(agent)?;
        owner.identifiers.insert(name.to_string(), hab);
        owner.key_index.insert(name.to_string(), 0);

        let intent = format!("icp.{}", event.said());
        let (serder, sigs) = self.endorse(agent, name, 0, &intent, move |_| {
            Ok(Escrow::new(
                event,
                Threshold::Count(1),
                Effect {
                    publish: Some(state),
                    action: Action::None,
                },
            ))
        })?;
        let op = self.track(agent, "done", PendingOp::Escrow { intent })?;
        Ok(EventResult { serder, sigs, op })
    }

    fn incept_group(&mut self, agent: &str, name: &str, args: &InceptionArgs) -> AgentResult<EventResult> {
        let mhab = args
            .mhab
            .as_deref()
            .ok_or_else(|| rejected("group inception needs a local member (mhab)"))?;
        let member = self.identifier(agent, mhab)?;
        if args.states.is_empty() || args.rstates.is_empty() {
            return Err(rejected("group inception needs member states and rstates"));
        }
        self.check_fresh(&args.states)?;
        self.check_fresh(&args.rstates)?;
        let smids: Vec<String> = args.states.iter().map(|s| s.prefix.clone()).collect();
        let rmids: Vec<String> = args.rstates.iter().map(|s| s.prefix.clone()).collect();
        let position = smids
            .iter()
            .position(|smid| *smid == member.prefix)
            .ok_or_else(|| rejected(format!("{} is not among the signing states", mhab)))?;

        let keys = args
            .states
            .iter()
            .filter_map(|s| s.keys.first().cloned())
            .collect();
        let next = args
            .rstates
            .iter()
            .filter_map(|s| s.next_digests.first().cloned())
            .collect();
        let (event, state) = establish(Establishment {
            ilk: if args.delpre.is_some() { "dip" } else { "icp" },
            prefix: None,
            sn: 0,
            prior: None,
            kt: args
                .isith
                .clone()
                .unwrap_or(Threshold::Count(smids.len() as u64)),
            keys,
            nt: args
                .nsith
                .clone()
                .unwrap_or(Threshold::Count(rmids.len() as u64)),
            next,
            toad: args.toad,
            wits: args.wits.clone(),
            delegator: args.delpre.as_deref(),
        })?;
        let prefix = event.prefix().to_string();
        let owner = self.agent_mut(agent)?;
        match owner.identifiers.get(name) {
            Some(existing) if existing.prefix != prefix => {
                return Err(rejected(format!("identifier {} already exists", name)))
            }
            _ => {}
        }
        owner.identifiers.insert(
            name.to_string(),
            Identifier {
                name: name.to_string(),
                prefix: prefix.clone(),
                state: state.clone(),
                group: Some(GroupRecord {
                    mhab: mhab.to_string(),
                    smids,
                    rmids,
                }),
            },
        );

        let threshold = state.signing_threshold.clone();
        let intent = format!("icp.{}", event.said());
        let (serder, sigs) = self.endorse(agent, mhab, position, &intent, move |_| {
            Ok(Escrow::new(
                event,
                threshold,
                Effect {
                    publish: Some(state),
                    action: Action::None,
                },
            ))
        })?;
        let pending = match &args.delpre {
            Some(delegator) => PendingOp::Delegated {
                intent,
                delegate: prefix,
                delegator: delegator.clone(),
                sn: 0,
            },
            None => PendingOp::Escrow { intent },
        };
        let op = self.track(agent, "group", pending)?;
        info!("group_incepted agent={} name={} prefix={}", agent, name, serder.prefix());
        Ok(EventResult { serder, sigs, op })
    }

    fn rotate_single(&mut self, agent: &str, name: &str, hab: Identifier) -> AgentResult<EventResult> {
        let owner = self.agent(agent)?;
        if owner.refused_rotations.contains(name) {
            return Err(rejected(format!("rotation of {} refused", name)));
        }
        let index = owner.key_index.get(name).copied().unwrap_or_default() + 1;
        let keys = owner.keys_for(name);
        let current = hab.state;
        let (event, state) = establish(Establishment {
            ilk: "rot",
            prefix: Some(&hab.prefix),
            sn: current.sn() + 1,
            prior: Some(&current.digest),
            kt: current.signing_threshold.clone(),
            keys: vec![keys.public_key_qb64(index)?],
            nt: current.next_threshold.clone(),
            next: vec![keys.next_digest(index)?],
            toad: current.toad(),
            wits: current.witnesses.clone(),
            delegator: current.delegator(),
        })?;
        self.agent_mut(agent)?
            .key_index
            .insert(name.to_string(), index);

        let intent = format!("rot.{}", event.said());
        let (serder, sigs) = self.endorse(agent, name, 0, &intent, move |_| {
            Ok(Escrow::new(
                event,
                Threshold::Count(1),
                Effect {
                    publish: Some(state),
                    action: Action::None,
                },
            ))
        })?;
        let op = self.track(agent, "done", PendingOp::Escrow { intent })?;
        Ok(EventResult { serder, sigs, op })
    }

    fn rotate_group(&mut self, agent: &str, name: &str, args: &RotationArgs) -> AgentResult<EventResult> {
        if args.states.is_empty() || args.rstates.is_empty() {
            return Err(rejected("group rotation needs member states and rstates"));
        }
        self.check_fresh(&args.states)?;
        self.check_fresh(&args.rstates)?;
        let hab = self.identifier(agent, name)?;
        let group = hab
            .group
            .clone()
            .ok_or_else(|| rejected(format!("{} is not a group", name)))?;
        let member = self.identifier(agent, &group.mhab)?;
        let smids: Vec<String> = args.states.iter().map(|s| s.prefix.clone()).collect();
        let rmids: Vec<String> = args.rstates.iter().map(|s| s.prefix.clone()).collect();
        let position = smids
            .iter()
            .position(|smid| *smid == member.prefix)
            .ok_or_else(|| rejected(format!("{} is not among the signing states", group.mhab)))?;

        let basis: Vec<&str> = args
            .states
            .iter()
            .chain(args.rstates.iter())
            .map(|s| s.digest.as_str())
            .collect();
        let intent = format!("rot.{}.{}", hab.prefix, digest_qb64(basis.join(",").as_bytes()));
        let current = hab.state.clone();
        let sn = current.sn() + 1;
        let delegator = current.delegator().map(String::from);
        let ilk = if delegator.is_some() { "drt" } else { "rot" };
        let (isith, nsith) = (args.isith.clone(), args.nsith.clone());
        let (states, rstates) = (args.states.clone(), args.rstates.clone());
        let (serder, sigs) = self.endorse(agent, &group.mhab, position, &intent, move |_| {
            let (event, state) = establish(Establishment {
                ilk,
                prefix: Some(&current.prefix),
                sn,
                prior: Some(&current.digest),
                kt: isith.unwrap_or_else(|| current.signing_threshold.clone()),
                keys: states.iter().filter_map(|s| s.keys.first().cloned()).collect(),
                nt: nsith.unwrap_or_else(|| current.next_threshold.clone()),
                next: rstates
                    .iter()
                    .filter_map(|s| s.next_digests.first().cloned())
                    .collect(),
                toad: current.toad(),
                wits: current.witnesses.clone(),
                delegator: current.delegator(),
            })?;
            let threshold = current.signing_threshold.clone();
            Ok(Escrow::new(
                event,
                threshold,
                Effect {
                    publish: Some(state),
                    action: Action::None,
                },
            ))
        })?;
        if let Some(stored) = self.agent_mut(agent)?.identifiers.get_mut(name) {
            stored.group = Some(GroupRecord {
                mhab: group.mhab.clone(),
                smids,
                rmids,
            });
        }
        let pending = match delegator {
            Some(delegator) => PendingOp::Delegated {
                intent,
                delegate: hab.prefix.clone(),
                delegator,
                sn,
            },
            None => PendingOp::Escrow { intent },
        };
        let op = self.track(agent, "group", pending)?;
        info!("group_rotation_signed agent={} name={} sn={} ilk={}", agent, name, serder.sn(), serder.ilk());
        Ok(EventResult { serder, sigs, op })
    }

    fn add_end_role(
        &mut self,
        agent: &str,
        name: &str,
        role: &str,
        eid: &str,
        stamp: Option<&str>,
    ) -> AgentResult<EventResult> {
        let signer = self.signer(agent, name)?;
        let prefix = signer.identifier.prefix.clone();
        let event = saidify(
            json!({
                "v": KERI_VERSION,
                "t": "rpy",
                "d": "",
                "dt": stamp.map(String::from).unwrap_or_else(timestamp),
                "r": "/end/role/add",
                "a": {"cid": prefix, "role": role, "eid": eid},
            }),
            false,
        )?;
        let intent = format!("rpy.{}", event.said());
        let effect = Effect {
            publish: None,
            action: Action::EndRole {
                prefix,
                role: role.to_string(),
                eid: eid.to_string(),
            },
        };
        let threshold = signer.threshold;
        let (serder, sigs) = self.endorse(agent, &signer.name, signer.position, &intent, move |_| {
            Ok(Escrow::new(event, threshold, effect))
        })?;
        let op = self.track(agent, "endrole", PendingOp::Escrow { intent })?;
        Ok(EventResult { serder, sigs, op })
    }

    fn group_members(&self, agent: &str, name: &str) -> AgentResult<GroupMembers> {
        let hab = self.identifier(agent, name)?;
        let group = hab
            .group
            .ok_or_else(|| rejected(format!("{} is not a group", name)))?;
        let describe = |aid: &String| {
            let ends = self
                .agents
                .values()
                .filter(|a| {
                    a.identifiers
                        .values()
                        .any(|h| h.prefix == *aid && h.group.is_none())
                })
                .map(|a| a.agent_prefix.clone())
                .collect::<Vec<_>>();
            GroupMember {
                aid: aid.clone(),
                ends: BTreeMap::from([("agent".to_string(), ends)]),
            }
        };
        Ok(GroupMembers {
            signing: group.smids.iter().map(describe).collect(),
            rotation: group.rmids.iter().map(describe).collect(),
        })
    }

    fn oobis(&self, agent: &str, name: &str, role: &str) -> AgentResult<Vec<String>> {
        let hab = self.identifier(agent, name)?;
        Ok(self
            .end_roles
            .get(&(hab.prefix.clone(), role.to_string()))
            .map(|eids| {
                eids.iter()
                    .map(|eid| format!("{}/oobi/{}/{}/{}", OOBI_HOST, hab.prefix, role, eid))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn send_exchange(
        &mut self,
        agent: &str,
        sender_name: &str,
        group_name: &str,
        message: &ExchangeMessage,
    ) -> AgentResult<()> {
        let sender = self.identifier(agent, sender_name)?;
        self.identifier(agent, group_name)?;
        for recipient in &message.recipients {
            if !self.agents.values().any(|a| a.holds(recipient)) {
                return Err(AgentError::NotFound(format!("recipient {}", recipient)));
            }
        }
        self.counter += 1;
        let body = format!(
            "{}|{}|{}",
            serde_json::to_string(message)?,
            sender.prefix,
            self.counter
        );
        let said = digest_qb64(body.as_bytes());
        self.exchanges.insert(
            said.clone(),
            ExchangeRecord {
                said: said.clone(),
                sender: sender.prefix.clone(),
                message: message.clone(),
            },
        );
        for recipient in &message.recipients {
            self.notify(recipient, message.route, &said);
        }
        debug!(
            "exchange_sent route={} sender={} recipients={}",
            message.route,
            sender.prefix,
            message.recipients.len()
        );
        Ok(())
    }

    fn create_registry(
        &mut self,
        agent: &str,
        name: &str,
        registry_name: &str,
        nonce: &str,
    ) -> AgentResult<RegistryResult> {
        let signer = self.signer(agent, name)?;
        let prefix = signer.identifier.prefix.clone();
        let regser = saidify(
            json!({
                "v": KERI_VERSION,
                "t": "vcp",
                "d": "",
                "i": "",
                "ii": prefix,
                "s": "0",
                "c": ["NB"],
                "bt": "0",
                "b": [],
                "n": nonce,
            }),
            true,
        )?;
        let regk = regser.prefix().to_string();
        let intent = format!("vcp.{}", regk);
        let current = signer.identifier.state.clone();
        let threshold = signer.threshold;
        let registry = Registry {
            name: registry_name.to_string(),
            regk: regk.clone(),
        };
        let (anc, sigs) = self.endorse(agent, &signer.name, signer.position, &intent, move |_| {
            let (anc, state) = interact(&current, json!([{"i": regk, "s": "0", "d": regk}]))?;
            Ok(Escrow::new(
                anc,
                threshold,
                Effect {
                    publish: Some(state),
                    action: Action::Registry { prefix, registry },
                },
            ))
        })?;
        let op = self.track(agent, "registry", PendingOp::Escrow { intent })?;
        Ok(RegistryResult {
            regser,
            anc,
            sigs,
            op,
        })
    }

    fn issue_credential(
        &mut self,
        agent: &str,
        name: &str,
        data: &CredentialData,
    ) -> AgentResult<IssuanceResult> {
        let signer = self.signer(agent, name)?;
        let prefix = signer.identifier.prefix.clone();
        if data.i != prefix {
            return Err(rejected(format!("{} cannot issue as {}", name, data.i)));
        }
        let registered = self
            .registries
            .get(&prefix)
            .map_or(false, |regs| regs.iter().any(|r| r.regk == data.ri));
        if !registered {
            return Err(AgentError::NotFound(format!("registry {}", data.ri)));
        }
        let mut body = serde_json::to_value(data)?;
        body["v"] = json!(ACDC_VERSION);
        let acdc = saidify(body, false)?;
        let iss = saidify(
            json!({
                "v": KERI_VERSION,
                "t": "iss",
                "d": "",
                "i": acdc.said(),
                "s": "0",
                "ri": data.ri,
                "dt": data.a.dt,
            }),
            false,
        )?;
        let sad: Acdc = serde_json::from_value(acdc.ked().clone())?;
        let intent = format!("iss.{}", acdc.said());
        let current = signer.identifier.state.clone();
        let threshold = signer.threshold;
        let issued = iss.clone();
        let (anc, sigs) = self.endorse(agent, &signer.name, signer.position, &intent, move |_| {
            let seal = json!([{"i": sad.said, "s": "0", "d": issued.said()}]);
            let (anc, state) = interact(&current, seal)?;
            let credential = Credential {
                sad,
                anc: anc.clone(),
                iss: issued,
                ancatc: String::new(),
            };
            Ok(Escrow::new(
                anc,
                threshold,
                Effect {
                    publish: Some(state),
                    action: Action::Issue(credential),
                },
            ))
        })?;
        let op = self.track(agent, "credential", PendingOp::Escrow { intent })?;
        Ok(IssuanceResult {
            acdc,
            iss,
            anc,
            sigs,
            op,
        })
    }

    fn issued_credentials(
        &self,
        agent: &str,
        issuer: &str,
        issuee: &str,
        schema: &str,
    ) -> AgentResult<Vec<Credential>> {
        let owner = self.agent(agent)?;
        if !owner.holds(issuer) {
            return Ok(Vec::new());
        }
        Ok(self
            .issued
            .iter()
            .filter(|c| c.issuer() == issuer && c.issuee() == issuee && c.sad.schema == schema)
            .cloned()
            .collect())
    }

    fn get_credential(&mut self, agent: &str, said: &str) -> AgentResult<Option<Credential>> {
        let owner = self.agent_mut(agent)?;
        if owner.hidden_lookups > 0 {
            owner.hidden_lookups -= 1;
            return Ok(None);
        }
        if let Some(credential) = owner.held.get(said) {
            return Ok(Some(credential.clone()));
        }
        let owner = self.agent(agent)?;
        Ok(self
            .issued
            .iter()
            .find(|c| c.said() == said && owner.holds(c.issuer()))
            .cloned())
    }

    fn sign_message(&self, agent: &str, name: &str, exn: EventMessage) -> AgentResult<IpexMessage> {
        let signer = self.signer(agent, name)?;
        let owner = self.agent(agent)?;
        let index = owner.key_index.get(&signer.name).copied().unwrap_or_default();
        let sig = owner
            .keys_for(&signer.name)
            .sign_indexed(index, signer.position, exn.raw().as_bytes())?;
        Ok(IpexMessage {
            exn,
            sigs: vec![sig],
            end: String::new(),
        })
    }

    fn grant(&self, agent: &str, args: &GrantArgs) -> AgentResult<IpexMessage> {
        let sender = self.identifier(agent, &args.sender_name)?;
        let credential = &args.credential;
        let exn = exchange_event(
            &sender.prefix,
            &args.recipient,
            "/ipex/grant",
            "",
            &args.datetime,
            json!({"m": "", "i": args.recipient}),
            json!({
                "acdc": serde_json::to_value(&credential.sad)?,
                "iss": credential.iss.ked(),
                "anc": credential.anc.ked(),
            }),
        )?;
        self.sign_message(agent, &args.sender_name, exn)
    }

    fn admit(&self, agent: &str, args: &AdmitArgs) -> AgentResult<IpexMessage> {
        let sender = self.identifier(agent, &args.sender_name)?;
        let grant = self
            .exchanges
            .get(&args.grant_said)
            .ok_or_else(|| AgentError::NotFound(format!("grant {}", args.grant_said)))?;
        if grant.message.route != Route::IpexGrant || !grant.message.recipients.contains(&sender.prefix) {
            return Err(rejected(format!(
                "{} was not granted to {}",
                args.grant_said, sender.prefix
            )));
        }
        let exn = exchange_event(
            &sender.prefix,
            &args.recipient,
            "/ipex/admit",
            &args.grant_said,
            &args.datetime,
            json!({"m": args.message}),
            json!({}),
        )?;
        self.sign_message(agent, &args.sender_name, exn)
    }

    fn submit_ipex(
        &mut self,
        agent: &str,
        name: &str,
        message: &IpexMessage,
        recipients: &[String],
        route: Route,
    ) -> AgentResult<Operation> {
        let signer = self.signer(agent, name)?;
        let sender = signer.identifier.prefix.clone();
        let said = message.exn.said().to_string();
        let admitted = match route {
            Route::IpexGrant => {
                let credential = credential_from_grant(&message.exn)?;
                self.grants.insert(said.clone(), credential);
                None
            }
            _ => {
                let granted = message.exn.ked().get("p").and_then(Value::as_str).unwrap_or_default();
                let credential = self
                    .grants
                    .get(granted)
                    .cloned()
                    .ok_or_else(|| AgentError::NotFound(format!("grant {}", granted)))?;
                Some((sender.clone(), credential))
            }
        };
        let record = ExchangeRecord {
            said: said.clone(),
            sender: sender.clone(),
            message: ExchangeMessage {
                route,
                payload: ExchangePayload::group(sender),
                embeds: BTreeMap::from([(
                    "exn".to_string(),
                    Embed {
                        event: message.exn.clone(),
                        attachment: message.end.clone(),
                    },
                )]),
                recipients: recipients.to_vec(),
            },
        };
        let intent = format!("exn.{}", said);
        let exn = message.exn.clone();
        let threshold = signer.threshold;
        self.endorse(agent, &signer.name, signer.position, &intent, move |_| {
            Ok(Escrow::new(
                exn,
                threshold,
                Effect {
                    publish: None,
                    action: Action::Deliver { record, admitted },
                },
            ))
        })?;
        self.track(agent, "exchange", PendingOp::Escrow { intent })
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AgentResult<MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|_| rejected("local network state poisoned"))
    }

    /// Registers (or reopens) the agent `id`, whose keys derive from `seed`.
    pub fn agent_with_seed(&self, id: &str, seed: &str) -> AgentResult<LocalAgent> {
        self.lock()?
            .agents
            .entry(id.to_string())
            .or_insert_with(|| AgentState::new(id, seed));
        Ok(LocalAgent {
            network: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn agent(&self, id: &str) -> AgentResult<LocalAgent> {
        self.agent_with_seed(id, &format!("{}-seed", id))
    }

    pub fn mute_mailbox(&self, id: &str, muted: bool) -> AgentResult<()> {
        self.lock()?.agent_mut(id)?.muted = muted;
        Ok(())
    }

    pub fn fail_marking(&self, id: &str, failing: bool) -> AgentResult<()> {
        self.lock()?.agent_mut(id)?.marks_fail = failing;
        Ok(())
    }

    /// Ordered names of the trait calls agent `id` received.
    pub fn calls(&self, id: &str) -> AgentResult<Vec<String>> {
        Ok(self.lock()?.agent(id)?.calls.clone())
    }

    pub fn refuse_rotation(&self, id: &str, identifier: &str) -> AgentResult<()> {
        self.lock()?
            .agent_mut(id)?
            .refused_rotations
            .insert(identifier.to_string());
        Ok(())
    }

    /// Makes the next `lookups` credential lookups at agent `id` find nothing.
    pub fn hide_credentials(&self, id: &str, lookups: u32) -> AgentResult<()> {
        self.lock()?.agent_mut(id)?.hidden_lookups = lookups;
        Ok(())
    }

    /// Accepted key state of `prefix`.
    pub fn published_state(&self, prefix: &str) -> AgentResult<Option<KeyState>> {
        Ok(self.lock()?.kels.get(prefix).cloned())
    }

    /// Anchors the latest accepted establishment event of delegated
    /// identifier `delegate` in its delegator's KEL and returns the delegator
    /// sequence number that approved it.
    pub fn approve_delegation(&self, delegate: &str) -> AgentResult<u64> {
        let mut state = self.lock()?;
        let delegated = state
            .kels
            .get(delegate)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("key state {}", delegate)))?;
        let delegator = delegated
            .delegator()
            .ok_or_else(|| rejected(format!("{} is not delegated", delegate)))?
            .to_string();
        let prior = state
            .kels
            .get(&delegator)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("key state {}", delegator)))?;
        let (_, approved) = interact(
            &prior,
            json!([{"i": delegate, "s": delegated.sequence, "d": delegated.ee.d}]),
        )?;
        let sn = approved.sn();
        state.kels.insert(delegator, approved);
        state.delegations.insert((delegate.to_string(), delegated.sn()), sn);
        info!(
            "delegation_approved delegate={} delegate_sn={} delegator_sn={}",
            delegate,
            delegated.sn(),
            sn
        );
        Ok(sn)
    }
}

impl LocalAgent {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn run<T>(&self, call: &str, f: impl FnOnce(&mut NetworkState, &str) -> AgentResult<T>) -> AgentResult<T> {
        let mut state = self.network.lock()?;
        state.agent_mut(&self.id)?.calls.push(call.to_string());
        f(&mut *state, &self.id)
    }
}

#[async_trait]
impl IdentityAgent for LocalAgent {
    async fn get_identifier(&self, name: &str) -> AgentResult<Option<Identifier>> {
        self.run("get_identifier", |st, id| {
            Ok(st.agent(id)?.identifiers.get(name).map(|hab| st.resolved(hab)))
        })
    }

    async fn create_identifier(&self, name: &str, args: &InceptionArgs) -> AgentResult<EventResult> {
        self.run("create_identifier", |st, id| match args.algo {
            Algo::Group => st.incept_group(id, name, args),
            Algo::Salty | Algo::Randy => {
                if st.agent(id)?.identifiers.contains_key(name) {
                    return Err(rejected(format!("identifier {} already exists", name)));
                }
                st.incept_single(id, name, args)
            }
        })
    }

    async fn rotate_identifier(&self, name: &str, args: &RotationArgs) -> AgentResult<EventResult> {
        self.run("rotate_identifier", |st, id| {
            let hab = st.identifier(id, name)?;
            if hab.is_group() {
                st.rotate_group(id, name, args)
            } else {
                st.rotate_single(id, name, hab)
            }
        })
    }

    async fn add_end_role(
        &self,
        name: &str,
        role: &str,
        eid: &str,
        stamp: Option<&str>,
    ) -> AgentResult<EventResult> {
        self.run("add_end_role", |st, id| st.add_end_role(id, name, role, eid, stamp))
    }

    async fn group_members(&self, name: &str) -> AgentResult<GroupMembers> {
        self.run("group_members", |st, id| st.group_members(id, name))
    }

    async fn oobis(&self, name: &str, role: &str) -> AgentResult<Vec<String>> {
        self.run("oobis", |st, id| st.oobis(id, name, role))
    }

    async fn query_key_state(&self, prefix: &str, sn: Option<u64>) -> AgentResult<Operation> {
        self.run("query_key_state", |st, id| {
            st.track(
                id,
                "query",
                PendingOp::Query {
                    prefix: prefix.to_string(),
                    sn,
                },
            )
        })
    }

    async fn get_operation(&self, name: &str) -> AgentResult<Operation> {
        self.run("get_operation", |st, id| st.poll(id, name))
    }

    async fn delete_operation(&self, name: &str) -> AgentResult<()> {
        self.run("delete_operation", |st, id| {
            st.agent_mut(id)?
                .operations
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| AgentError::NotFound(format!("operation {}", name)))
        })
    }

    async fn list_notifications(&self) -> AgentResult<Vec<Notification>> {
        self.run("list_notifications", |st, id| {
            let owner = st.agent(id)?;
            if owner.muted {
                return Ok(Vec::new());
            }
            Ok(owner.notifications.clone())
        })
    }

    async fn mark_notification(&self, note: &str) -> AgentResult<()> {
        self.run("mark_notification", |st, id| {
            let owner = st.agent_mut(id)?;
            if owner.marks_fail {
                return Err(AgentError::Status {
                    status: 503,
                    body: format!("notification {} not marked", note),
                });
            }
            let entry = owner
                .notifications
                .iter_mut()
                .find(|n| n.i == note)
                .ok_or_else(|| AgentError::NotFound(format!("notification {}", note)))?;
            entry.r = true;
            Ok(())
        })
    }

    async fn delete_notification(&self, note: &str) -> AgentResult<()> {
        self.run("delete_notification", |st, id| {
            let owner = st.agent_mut(id)?;
            let before = owner.notifications.len();
            owner.notifications.retain(|n| n.i != note);
            if owner.notifications.len() == before {
                return Err(AgentError::NotFound(format!("notification {}", note)));
            }
            Ok(())
        })
    }

    async fn send_exchange(
        &self,
        sender_name: &str,
        group_name: &str,
        message: &ExchangeMessage,
    ) -> AgentResult<()> {
        self.run("send_exchange", |st, id| {
            st.send_exchange(id, sender_name, group_name, message)
        })
    }

    async fn get_exchange(&self, said: &str) -> AgentResult<ExchangeRecord> {
        self.run("get_exchange", |st, _| {
            st.exchanges
                .get(said)
                .cloned()
                .ok_or_else(|| AgentError::NotFound(format!("exchange {}", said)))
        })
    }

    async fn list_registries(&self, name: &str) -> AgentResult<Vec<Registry>> {
        self.run("list_registries", |st, id| {
            let hab = st.identifier(id, name)?;
            Ok(st.registries.get(&hab.prefix).cloned().unwrap_or_default())
        })
    }

    async fn create_registry(
        &self,
        name: &str,
        registry_name: &str,
        nonce: &str,
    ) -> AgentResult<RegistryResult> {
        self.run("create_registry", |st, id| {
            st.create_registry(id, name, registry_name, nonce)
        })
    }

    async fn issue_credential(&self, name: &str, data: &CredentialData) -> AgentResult<IssuanceResult> {
        self.run("issue_credential", |st, id| st.issue_credential(id, name, data))
    }

    async fn issued_credentials(
        &self,
        issuer: &str,
        issuee: &str,
        schema: &str,
    ) -> AgentResult<Vec<Credential>> {
        self.run("issued_credentials", |st, id| {
            st.issued_credentials(id, issuer, issuee, schema)
        })
    }

    async fn get_credential(&self, said: &str) -> AgentResult<Option<Credential>> {
        self.run("get_credential", |st, id| st.get_credential(id, said))
    }

    async fn grant(&self, args: &GrantArgs) -> AgentResult<IpexMessage> {
        self.run("grant", |st, id| st.grant(id, args))
    }

    async fn submit_grant(
        &self,
        name: &str,
        grant: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation> {
        self.run("submit_grant", |st, id| {
            st.submit_ipex(id, name, grant, recipients, Route::IpexGrant)
        })
    }

    async fn admit(&self, args: &AdmitArgs) -> AgentResult<IpexMessage> {
        self.run("admit", |st, id| st.admit(id, args))
    }

    async fn submit_admit(
        &self,
        name: &str,
        admit: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation> {
        self.run("submit_admit", |st, id| {
            st.submit_ipex(id, name, admit, recipients, Route::IpexAdmit)
        })
    }
}
