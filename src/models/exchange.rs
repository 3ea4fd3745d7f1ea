// src/models/exchange.rs
//! Exchange (peer-to-peer) message envelopes.

use crate::models::event::EventMessage;
use crate::models::notification::Route;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Structured payload of a multisig exchange. Role and credential routes carry
/// only the group id; inception and rotation also name the member lists.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangePayload {
    pub gid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rmids: Option<Vec<String>>,
}

impl ExchangePayload {
    pub fn group(gid: impl Into<String>) -> Self {
        Self {
            gid: gid.into(),
            smids: None,
            rmids: None,
        }
    }

    pub fn with_members(gid: impl Into<String>, smids: Vec<String>, rmids: Vec<String>) -> Self {
        Self {
            gid: gid.into(),
            smids: Some(smids),
            rmids: Some(rmids),
        }
    }
}

/// An embedded event and its attachment stream (signatures, seals). The
/// attachment may be empty for events whose signatures travel elsewhere.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Embed {
    pub event: EventMessage,
    #[serde(default)]
    pub attachment: String,
}

/// Outbound envelope: route, payload, labelled embeds and explicit recipients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangeMessage {
    pub route: Route,
    pub payload: ExchangePayload,
    pub embeds: BTreeMap<String, Embed>,
    pub recipients: Vec<String>,
}

impl ExchangeMessage {
    pub fn embed(&self, label: &str) -> Option<&Embed> {
        self.embeds.get(label)
    }
}

/// An exchange message as stored by the receiving agent, with the SAID the
/// notification referred to and the sending member's prefix.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub said: String,
    pub sender: String,
    pub message: ExchangeMessage,
}
