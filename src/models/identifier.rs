// src/models/identifier.rs
//! Identifier records and the arguments used to create or rotate them.

use crate::models::key_state::{KeyState, Threshold};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Group bookkeeping kept on a party's local record of a multisig identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupRecord {
    /// Name of the party's own member identifier that signs for the group
    pub mhab: String,
    #[serde(default)]
    pub smids: Vec<String>,
    #[serde(default)]
    pub rmids: Vec<String>,
}

/// A named identifier as held in one party's agent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Identifier {
    pub name: String,
    pub prefix: String,
    pub state: KeyState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupRecord>,
}

impl Identifier {
    pub fn sn(&self) -> u64 {
        self.state.sn()
    }

    pub fn is_group(&self) -> bool {
        self.group.is_some()
    }
}

/// Key generation algorithm requested at inception.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Algo {
    #[default]
    Salty,
    Randy,
    Group,
}

/// Arguments of an identifier inception. For a group, `states` and `rstates`
/// carry the member key-state snapshots and `mhab` names the local member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct InceptionArgs {
    pub algo: Algo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isith: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsith: Option<Threshold>,
    #[serde(default)]
    pub toad: u64,
    #[serde(default)]
    pub wits: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<KeyState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rstates: Vec<KeyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delpre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mhab: Option<String>,
}

/// Arguments of a rotation. Empty for a single-signature identifier; a group
/// rotation lists the signing (`states`) and rotation (`rstates`) member snapshots.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct RotationArgs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<KeyState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rstates: Vec<KeyState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isith: Option<Threshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nsith: Option<Threshold>,
}

/// One member of a group with the endpoints it has authorized, by role.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupMember {
    pub aid: String,
    #[serde(default)]
    pub ends: BTreeMap<String, Vec<String>>,
}

/// Signing and rotation member lists of a group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct GroupMembers {
    #[serde(default)]
    pub signing: Vec<GroupMember>,
    #[serde(default)]
    pub rotation: Vec<GroupMember>,
}

impl GroupMembers {
    pub fn signing_prefixes(&self) -> Vec<String> {
        self.signing.iter().map(|m| m.aid.clone()).collect()
    }
}
