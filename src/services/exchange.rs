// src/services/exchange.rs
//! Exchange composer and per-recipient delivery tracking.
//!
//! [`compose`] is a pure transform from signed events to an outbound
//! [`ExchangeMessage`]; the send happens through the party's agent in
//! [`send`]. Fan-out is explicit message passing, so the initiator keeps a
//! [`DeliveryLedger`] of which peers were sent the announcement and which
//! have confirmed.

use crate::error::CoordinationResult;
use crate::models::event::{EventMessage, SealEvent};
use crate::models::exchange::{Embed, ExchangeMessage, ExchangePayload};
use crate::models::key_state::parse_hex;
use crate::models::notification::Route;
use crate::utils::crypto::{counter, seqner_qb64};
use crate::wallet::party::Party;
use log::info;
use std::collections::BTreeMap;

/// Attachment stream for an embedded event: an optional seal group naming
/// the establishment event the signatures verify against, then the
/// indexed signatures.
pub fn attachment(sigs: &[String], seal: Option<&SealEvent>) -> String {
    let mut atc = String::new();
    if let Some(seal) = seal {
        atc.push_str(&counter("-F", 1));
        atc.push_str(&seal.i);
        atc.push_str(&seqner_qb64(parse_hex(&seal.s).unwrap_or_default()));
        atc.push_str(&seal.d);
    }
    if !sigs.is_empty() {
        atc.push_str(&counter("-A", sigs.len()));
        for sig in sigs {
            atc.push_str(sig);
        }
    }
    atc
}

pub fn embed(event: &EventMessage, sigs: &[String], seal: Option<&SealEvent>) -> Embed {
    Embed {
        event: event.clone(),
        attachment: attachment(sigs, seal),
    }
}

/// Builds the envelope for `route`.
pub fn compose<'a>(
    route: Route,
    payload: ExchangePayload,
    embeds: impl IntoIterator<Item = (&'a str, Embed)>,
    recipients: Vec<String>,
) -> ExchangeMessage {
    ExchangeMessage {
        route,
        payload,
        embeds: embeds
            .into_iter()
            .map(|(label, embed)| (label.to_string(), embed))
            .collect(),
        recipients,
    }
}

/// `members` minus every prefix in `exclude`, order preserved.
pub fn recipients(members: &[String], exclude: &[&str]) -> Vec<String> {
    members
        .iter()
        .filter(|m| !exclude.contains(&m.as_str()))
        .cloned()
        .collect()
}

/// Sends `message` from the party's member identifier on behalf of `group`.
pub async fn send(party: &Party, group: &str, message: &ExchangeMessage) -> CoordinationResult<()> {
    if message.recipients.is_empty() {
        return Ok(());
    }
    party
        .agent()
        .send_exchange(&party.member, group, message)
        .await?;
    info!(
        "exchange sent party={} route={} recipients={}",
        party.name,
        message.route,
        message.recipients.len()
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Confirmed,
}

/// Delivery state per peer prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryLedger {
    peers: BTreeMap<String, DeliveryState>,
}

impl DeliveryLedger {
    pub fn new(peers: impl IntoIterator<Item = String>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|peer| (peer, DeliveryState::Pending))
                .collect(),
        }
    }

    pub fn mark_sent(&mut self, peers: &[String]) {
        for peer in peers {
            if let Some(state) = self.peers.get_mut(peer) {
                if *state == DeliveryState::Pending {
                    *state = DeliveryState::Sent;
                }
            }
        }
    }

    /// Records a confirmation from `peer`; unknown peers are ignored.
    pub fn confirm(&mut self, peer: &str) -> bool {
        match self.peers.get_mut(peer) {
            Some(state) => {
                *state = DeliveryState::Confirmed;
                true
            }
            None => false,
        }
    }

    pub fn state(&self, peer: &str) -> Option<DeliveryState> {
        self.peers.get(peer).copied()
    }

    /// Peers that have not confirmed yet.
    pub fn pending(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, state)| **state != DeliveryState::Confirmed)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    pub fn all_confirmed(&self) -> bool {
        self.peers.values().all(|s| *s == DeliveryState::Confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rot() -> EventMessage {
        EventMessage::new(json!({"t": "rot", "d": "ERotSaid", "i": "EGroup", "s": "1"})).unwrap()
    }

    #[test]
    fn test_attachment_with_seal_and_signatures() {
        let seal = SealEvent {
            i: "EGroup".into(),
            s: "1".into(),
            d: "EEstablish".into(),
        };
        let sigs = vec!["2AAA_sig0".to_string(), "2AAB_sig1".to_string()];
        let atc = attachment(&sigs, Some(&seal));
        assert!(atc.starts_with("-FABEGroup0A"));
        assert!(atc.contains("EEstablish-AAC2AAA_sig02AAB_sig1"));
        assert_eq!(attachment(&[], None), "");
    }

    #[test]
    fn test_compose_rotation_envelope() {
        let smids = vec!["EA".to_string(), "EB".to_string(), "EC".to_string()];
        let msg = compose(
            Route::MultisigRot,
            ExchangePayload::with_members("EGroup", smids.clone(), smids.clone()),
            [("rot", embed(&rot(), &["2AAA_sig".to_string()], None))],
            recipients(&smids, &["EA"]),
        );
        assert_eq!(msg.route, Route::MultisigRot);
        assert_eq!(msg.recipients, vec!["EB".to_string(), "EC".to_string()]);
        assert_eq!(msg.embed("rot").unwrap().event.said(), "ERotSaid");
        assert_eq!(msg.embed("rot").unwrap().attachment, "-AAB2AAA_sig");
        assert_eq!(msg.payload.smids.as_deref(), Some(&smids[..]));
    }

    #[test]
    fn test_ledger_transitions() {
        let mut ledger = DeliveryLedger::new(vec!["EB".to_string(), "EC".to_string()]);
        assert_eq!(ledger.state("EB"), Some(DeliveryState::Pending));
        ledger.mark_sent(&["EB".to_string(), "EC".to_string(), "EZ".to_string()]);
        assert_eq!(ledger.state("EC"), Some(DeliveryState::Sent));
        assert_eq!(ledger.state("EZ"), None);

        assert!(ledger.confirm("EC"));
        assert!(!ledger.confirm("EZ"));
        assert_eq!(ledger.pending(), vec!["EB".to_string()]);
        assert!(!ledger.all_confirmed());
        // a confirmation can arrive before the send is recorded
        ledger.confirm("EB");
        ledger.mark_sent(&["EB".to_string()]);
        assert!(ledger.all_confirmed());
    }
}
