// src/models/credential.rs
//! Credential (ACDC) data model and the results of registry, issuance and
//! presentation calls.
//!
//! A credential moves through three states:
//! 1. issued - written to the issuer's registry, signed by the issuing group
//! 2. granted - offered to exactly one recipient through an IPEX grant exchange
//! 3. admitted - accepted by the recipient, which now holds its own copy

use crate::models::event::EventMessage;
use crate::models::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The subject block (`a`) of a credential.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialSubject {
    /// Issuee prefix
    pub i: String,
    pub dt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// Parameters of an issuance. Every issuing member must submit byte-identical
/// data, salts included, or the members sign different credentials.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    /// Issuer prefix
    pub i: String,
    /// Registry key
    pub ri: String,
    /// Schema SAID
    pub s: String,
    pub a: CredentialSubject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Value>,
}

/// The credential body as stored by an agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Acdc {
    #[serde(rename = "d")]
    pub said: String,
    #[serde(rename = "i")]
    pub issuer: String,
    #[serde(rename = "ri")]
    pub registry: String,
    #[serde(rename = "s")]
    pub schema: String,
    #[serde(rename = "a")]
    pub subject: CredentialSubject,
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<Value>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Value>,
}

/// A stored credential with the events that anchor it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Credential {
    pub sad: Acdc,
    /// Anchoring (interaction) event in the issuer's KEL
    pub anc: EventMessage,
    /// Registry issuance event
    pub iss: EventMessage,
    #[serde(default)]
    pub ancatc: String,
}

impl Credential {
    pub fn said(&self) -> &str {
        &self.sad.said
    }

    pub fn issuer(&self) -> &str {
        &self.sad.issuer
    }

    pub fn issuee(&self) -> &str {
        &self.sad.subject.i
    }
}

/// A credential registry owned by an identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Registry {
    pub name: String,
    pub regk: String,
}

/// Result of a registry inception: the registry event, the anchoring event
/// with its signatures, and the tracking operation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegistryResult {
    pub regser: EventMessage,
    pub anc: EventMessage,
    pub sigs: Vec<String>,
    pub op: Operation,
}

/// Result of a credential issuance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IssuanceResult {
    pub acdc: EventMessage,
    pub iss: EventMessage,
    pub anc: EventMessage,
    pub sigs: Vec<String>,
    pub op: Operation,
}

/// An IPEX grant or admit exchange built and signed by the agent but not yet
/// submitted. `end` is the pre-rendered attachment stream of embedded events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IpexMessage {
    pub exn: EventMessage,
    pub sigs: Vec<String>,
    #[serde(default)]
    pub end: String,
}

/// Arguments of an IPEX grant.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GrantArgs {
    /// Name of the granting identifier (group or single)
    pub sender_name: String,
    pub credential: Credential,
    pub recipient: String,
    pub datetime: String,
}

/// Arguments of an IPEX admit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdmitArgs {
    pub sender_name: String,
    /// SAID of the grant exchange being accepted
    pub grant_said: String,
    /// Prefix of the granting identifier
    pub recipient: String,
    pub datetime: String,
    #[serde(default)]
    pub message: String,
}
