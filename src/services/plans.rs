// src/services/plans.rs
//! Shared plans.
//!
//! Members only converge on the same group event when they submit
//! byte-identical parameters. Each group action is therefore described by one
//! plan value, built once (salts, nonces and timestamps included) and handed
//! unchanged to every member's submission.

use crate::error::{CoordinationError, CoordinationResult};
use crate::models::credential::{CredentialData, CredentialSubject};
use crate::models::identifier::{Algo, InceptionArgs, RotationArgs};
use crate::models::key_state::{KeyState, Threshold};
use crate::utils::crypto::random_salt;
use crate::utils::timestamp;
use serde_json::{Map, Value};

/// Group inception parameters shared by all members.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInceptionPlan {
    pub group: String,
    pub isith: Threshold,
    pub nsith: Threshold,
    pub toad: u64,
    pub wits: Vec<String>,
    /// Signing member snapshots, in member order
    pub states: Vec<KeyState>,
    /// Rotation member snapshots
    pub rstates: Vec<KeyState>,
    pub delpre: Option<String>,
}

impl GroupInceptionPlan {
    /// Plan with `states` as both signing and rotation members, all members
    /// required to sign.
    pub fn new(group: impl Into<String>, states: Vec<KeyState>) -> CoordinationResult<Self> {
        if states.is_empty() {
            return Err(CoordinationError::InvalidPlan("group inception needs member key states".into()));
        }
        let members = states.len() as u64;
        Ok(Self {
            group: group.into(),
            isith: Threshold::Count(members),
            nsith: Threshold::Count(members),
            toad: 0,
            wits: Vec::new(),
            rstates: states.clone(),
            states,
            delpre: None,
        })
    }

    pub fn with_thresholds(mut self, isith: Threshold, nsith: Threshold) -> Self {
        self.isith = isith;
        self.nsith = nsith;
        self
    }

    pub fn with_witnesses(mut self, wits: Vec<String>, toad: u64) -> Self {
        self.wits = wits;
        self.toad = toad;
        self
    }

    pub fn delegated_by(mut self, delegator: impl Into<String>) -> Self {
        self.delpre = Some(delegator.into());
        self
    }

    pub fn smids(&self) -> Vec<String> {
        self.states.iter().map(|s| s.prefix.clone()).collect()
    }

    pub fn rmids(&self) -> Vec<String> {
        self.rstates.iter().map(|s| s.prefix.clone()).collect()
    }

    /// Agent arguments for the member whose local identifier is `mhab`.
    pub fn args(&self, mhab: &str) -> InceptionArgs {
        InceptionArgs {
            algo: Algo::Group,
            isith: Some(self.isith.clone()),
            nsith: Some(self.nsith.clone()),
            toad: self.toad,
            wits: self.wits.clone(),
            states: self.states.clone(),
            rstates: self.rstates.clone(),
            delpre: self.delpre.clone(),
            mhab: Some(mhab.to_string()),
        }
    }
}

/// Group rotation parameters: fresh post-rotation member snapshots ordered
/// by the group's signing member list.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRotationPlan {
    pub group: String,
    pub states: Vec<KeyState>,
    pub rstates: Vec<KeyState>,
    pub isith: Option<Threshold>,
    pub nsith: Option<Threshold>,
}

impl GroupRotationPlan {
    pub fn new(group: impl Into<String>, states: Vec<KeyState>) -> Self {
        Self {
            group: group.into(),
            rstates: states.clone(),
            states,
            isith: None,
            nsith: None,
        }
    }

    pub fn smids(&self) -> Vec<String> {
        self.states.iter().map(|s| s.prefix.clone()).collect()
    }

    pub fn rmids(&self) -> Vec<String> {
        self.rstates.iter().map(|s| s.prefix.clone()).collect()
    }

    pub fn args(&self) -> RotationArgs {
        RotationArgs {
            states: self.states.clone(),
            rstates: self.rstates.clone(),
            isith: self.isith.clone(),
            nsith: self.nsith.clone(),
        }
    }
}

/// End-role authorization with one timestamp shared by every member's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndRolePlan {
    pub group: String,
    pub role: String,
    pub stamp: String,
}

impl EndRolePlan {
    pub fn agent_role(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            role: "agent".to_string(),
            stamp: timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPlan {
    pub group: String,
    pub registry_name: String,
    pub nonce: String,
}

impl RegistryPlan {
    pub fn new(group: impl Into<String>, registry_name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            registry_name: registry_name.into(),
            nonce: random_salt(),
        }
    }
}

/// Credential issuance with the salts and issuance time fixed up front.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuancePlan {
    pub group: String,
    pub data: CredentialData,
}

impl IssuancePlan {
    /// # Arguments
    /// * `issuer` - prefix of the issuing group
    /// * `registry` - registry key the credential is written to
    /// * `attributes` - subject attributes besides the issuee
    /// * `edge`, `rules` - optional provenance and rule blocks
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: impl Into<String>,
        issuer: impl Into<String>,
        registry: impl Into<String>,
        schema: impl Into<String>,
        issuee: impl Into<String>,
        attributes: Map<String, Value>,
        edge: Option<Value>,
        rules: Option<Value>,
    ) -> Self {
        Self {
            group: group.into(),
            data: CredentialData {
                u: Some(random_salt()),
                i: issuer.into(),
                ri: registry.into(),
                s: schema.into(),
                a: CredentialSubject {
                    i: issuee.into(),
                    dt: timestamp(),
                    u: Some(random_salt()),
                    attributes,
                },
                e: edge,
                r: rules,
            },
        }
    }

    pub fn issuer(&self) -> &str {
        &self.data.i
    }

    pub fn issuee(&self) -> &str {
        &self.data.a.i
    }

    pub fn schema(&self) -> &str {
        &self.data.s
    }
}

/// IPEX grant from `group` (or a single identifier) to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantPlan {
    pub group: String,
    pub recipient: String,
    pub datetime: String,
}

impl GrantPlan {
    pub fn new(group: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            recipient: recipient.into(),
            datetime: timestamp(),
        }
    }
}

/// IPEX admit by `holder` of credential `credential` granted by `issuer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitPlan {
    pub holder: String,
    pub issuer: String,
    /// SAID of the credential to admit
    pub credential: String,
    pub datetime: String,
    pub message: String,
}

impl AdmitPlan {
    pub fn new(holder: impl Into<String>, issuer: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            holder: holder.into(),
            issuer: issuer.into(),
            credential: credential.into(),
            datetime: timestamp(),
            message: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(prefix: &str) -> KeyState {
        serde_json::from_value(json!({"i": prefix, "s": "0", "d": format!("D{}", prefix)})).unwrap()
    }

    #[test]
    fn test_inception_args_are_identical_except_local_member() {
        let plan = GroupInceptionPlan::new("qvi", vec![state("EA"), state("EB")])
            .unwrap()
            .with_thresholds(Threshold::equal_weights(2), Threshold::equal_weights(2))
            .with_witnesses(vec!["BWit1".into()], 1);
        let a = plan.args("qar1");
        let b = plan.args("qar2");
        assert_eq!(a.states, b.states);
        assert_eq!(a.isith, b.isith);
        assert_eq!(a.mhab.as_deref(), Some("qar1"));
        assert_eq!(plan.smids(), vec!["EA".to_string(), "EB".to_string()]);
        assert_eq!(plan.rmids(), plan.smids());
    }

    #[test]
    fn test_empty_inception_plan_is_invalid() {
        assert!(matches!(
            GroupInceptionPlan::new("qvi", Vec::new()),
            Err(CoordinationError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_issuance_plan_fixes_salts_once() {
        let plan = IssuancePlan::new("qvi", "EQvi", "EReg", "ESchema", "EPerson", Map::new(), None, None);
        let copy = plan.clone();
        assert_eq!(plan.data, copy.data);
        assert!(plan.data.u.is_some());
        assert_ne!(plan.data.u, plan.data.a.u);
        assert_eq!(plan.issuee(), "EPerson");
    }
}
