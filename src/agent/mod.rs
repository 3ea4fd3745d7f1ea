// src/agent/mod.rs
//! The identity-agent collaborator.
//!
//! Each party owns one agent that holds its keys, signs events, talks to
//! witnesses and keeps the party's mailbox. This crate reaches the agent only
//! through [`IdentityAgent`]: submit calls return long-running
//! [`Operation`]s, queries return snapshots, and nothing is cached between calls.
//!
//! Two implementations ship with the crate:
//! - [`http::HttpAgent`]: JSON-over-HTTP client for a remote agent gateway
//! - [`local::LocalNetwork`]: in-process agents sharing a simulated network

pub mod http;
pub mod local;

use crate::error::AgentError;
use crate::models::credential::{
    AdmitArgs, Credential, CredentialData, GrantArgs, IpexMessage, IssuanceResult, Registry,
    RegistryResult,
};
use crate::models::event::EventResult;
use crate::models::exchange::{ExchangeMessage, ExchangeRecord};
use crate::models::identifier::{GroupMembers, Identifier, InceptionArgs, RotationArgs};
use crate::models::notification::Notification;
use crate::models::operation::Operation;
use async_trait::async_trait;

pub type AgentResult<T> = Result<T, AgentError>;

#[async_trait]
pub trait IdentityAgent: Send + Sync {
    // identifiers

    /// Local record of the identifier `name`, `None` if the agent has none.
    async fn get_identifier(&self, name: &str) -> AgentResult<Option<Identifier>>;

    async fn create_identifier(&self, name: &str, args: &InceptionArgs) -> AgentResult<EventResult>;

    async fn rotate_identifier(&self, name: &str, args: &RotationArgs) -> AgentResult<EventResult>;

    /// Authorizes endpoint `eid` for `role` on identifier `name`.
    async fn add_end_role(
        &self,
        name: &str,
        role: &str,
        eid: &str,
        stamp: Option<&str>,
    ) -> AgentResult<EventResult>;

    async fn group_members(&self, name: &str) -> AgentResult<GroupMembers>;

    /// OOBIs published for `role` on identifier `name`.
    async fn oobis(&self, name: &str, role: &str) -> AgentResult<Vec<String>>;

    // key state and operations

    /// Starts a key-state query for `prefix`, optionally until it reaches `sn`.
    async fn query_key_state(&self, prefix: &str, sn: Option<u64>) -> AgentResult<Operation>;

    async fn get_operation(&self, name: &str) -> AgentResult<Operation>;

    async fn delete_operation(&self, name: &str) -> AgentResult<()>;

    // mailbox

    async fn list_notifications(&self) -> AgentResult<Vec<Notification>>;

    async fn mark_notification(&self, id: &str) -> AgentResult<()>;

    async fn delete_notification(&self, id: &str) -> AgentResult<()>;

    // exchanges

    /// Sends `message` from member identifier `sender_name` on behalf of `group_name`.
    async fn send_exchange(
        &self,
        sender_name: &str,
        group_name: &str,
        message: &ExchangeMessage,
    ) -> AgentResult<()>;

    /// A received exchange message by SAID.
    async fn get_exchange(&self, said: &str) -> AgentResult<ExchangeRecord>;

    // registries and credentials

    async fn list_registries(&self, name: &str) -> AgentResult<Vec<Registry>>;

    async fn create_registry(
        &self,
        name: &str,
        registry_name: &str,
        nonce: &str,
    ) -> AgentResult<RegistryResult>;

    async fn issue_credential(&self, name: &str, data: &CredentialData) -> AgentResult<IssuanceResult>;

    async fn issued_credentials(
        &self,
        issuer: &str,
        issuee: &str,
        schema: &str,
    ) -> AgentResult<Vec<Credential>>;

    /// A credential held (received or issued) by this agent, by SAID.
    async fn get_credential(&self, said: &str) -> AgentResult<Option<Credential>>;

    async fn grant(&self, args: &GrantArgs) -> AgentResult<IpexMessage>;

    async fn submit_grant(
        &self,
        name: &str,
        grant: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation>;

    async fn admit(&self, args: &AdmitArgs) -> AgentResult<IpexMessage>;

    async fn submit_admit(
        &self,
        name: &str,
        admit: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation>;
}
