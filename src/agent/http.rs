// src/agent/http.rs
//! JSON-over-HTTP client for a remote identity agent gateway.
//!
//! Every trait call maps onto one request against the gateway's REST surface
//! (`/identifiers`, `/operations`, `/notifications`, `/exchanges`,
//! `/credentials`, `/ipex`). Request signing and agent authentication are the
//! gateway's concern; this client only forwards an optional bearer token.
//!
//! # Errors
//! - 404 responses become [`AgentError::NotFound`] (or `None` for lookups)
//! - any other non-success status becomes [`AgentError::Status`] with the body

use crate::agent::{AgentResult, IdentityAgent};
use crate::error::AgentError;
use crate::models::credential::{
    AdmitArgs, Credential, CredentialData, GrantArgs, IpexMessage, IssuanceResult, Registry,
    RegistryResult,
};
use crate::models::event::{EventMessage, EventResult};
use crate::models::exchange::{ExchangeMessage, ExchangeRecord};
use crate::models::identifier::{GroupMembers, Identifier, InceptionArgs, RotationArgs};
use crate::models::notification::Notification;
use crate::models::operation::Operation;
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one party's agent.
#[derive(Clone)]
pub struct HttpAgent {
    client: Client,
    base: Url,
    token: Option<String>,
}

#[derive(Deserialize)]
struct OobiList {
    #[serde(default)]
    oobis: Vec<String>,
}

#[derive(Serialize)]
struct IpexSubmission<'a> {
    exn: &'a EventMessage,
    sigs: &'a [String],
    atc: &'a str,
    rec: &'a [String],
}

impl HttpAgent {
    /// Creates a client for the agent at `base_url`.
    ///
    /// # Errors
    /// Returns [`AgentError::Url`] for an unparsable URL and
    /// [`AgentError::Http`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> AgentResult<Self> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(AgentError::Rejected(format!("{} cannot be a base url", base_url)));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base,
            token: token.filter(|t| !t.is_empty()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> AgentResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Rejected(format!("{} cannot be a base url", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder, what: &str) -> AgentResult<String> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!("agent_request what={} status={}", what, status.as_u16());
        if status == StatusCode::NOT_FOUND {
            return Err(AgentError::NotFound(what.to_string()));
        }
        if !status.is_success() {
            return Err(AgentError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> AgentResult<T> {
        let url = self.endpoint(segments)?;
        let what = url.path().to_string();
        let body = self.execute(self.request(Method::GET, url), &what).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn get_optional<T: DeserializeOwned>(&self, segments: &[&str]) -> AgentResult<Option<T>> {
        match self.get_json(segments).await {
            Ok(value) => Ok(Some(value)),
            Err(AgentError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn send_json<B, T>(&self, method: Method, segments: &[&str], body: &B) -> AgentResult<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(segments)?;
        let what = url.path().to_string();
        let body = self.execute(self.request(method, url).json(body), &what).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_empty(&self, method: Method, segments: &[&str]) -> AgentResult<()> {
        let url = self.endpoint(segments)?;
        let what = url.path().to_string();
        self.execute(self.request(method, url), &what).await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityAgent for HttpAgent {
    async fn get_identifier(&self, name: &str) -> AgentResult<Option<Identifier>> {
        self.get_optional(&["identifiers", name]).await
    }

    async fn create_identifier(&self, name: &str, args: &InceptionArgs) -> AgentResult<EventResult> {
        let mut body = serde_json::to_value(args)?;
        if let Value::Object(map) = &mut body {
            map.insert("name".into(), Value::String(name.to_string()));
        }
        self.send_json(Method::POST, &["identifiers"], &body).await
    }

    async fn rotate_identifier(&self, name: &str, args: &RotationArgs) -> AgentResult<EventResult> {
        self.send_json(Method::POST, &["identifiers", name, "rotate"], args)
            .await
    }

    async fn add_end_role(
        &self,
        name: &str,
        role: &str,
        eid: &str,
        stamp: Option<&str>,
    ) -> AgentResult<EventResult> {
        let body = json!({"role": role, "eid": eid, "stamp": stamp});
        self.send_json(Method::POST, &["identifiers", name, "endroles"], &body)
            .await
    }

    async fn group_members(&self, name: &str) -> AgentResult<GroupMembers> {
        self.get_json(&["identifiers", name, "members"]).await
    }

    async fn oobis(&self, name: &str, role: &str) -> AgentResult<Vec<String>> {
        let mut url = self.endpoint(&["identifiers", name, "oobis"])?;
        url.query_pairs_mut().append_pair("role", role);
        let what = url.path().to_string();
        let body = self.execute(self.request(Method::GET, url), &what).await?;
        let list: OobiList = serde_json::from_str(&body)?;
        Ok(list.oobis)
    }

    async fn query_key_state(&self, prefix: &str, sn: Option<u64>) -> AgentResult<Operation> {
        let body = json!({"pre": prefix, "sn": sn.map(|s| format!("{:x}", s))});
        self.send_json(Method::POST, &["queries"], &body).await
    }

    async fn get_operation(&self, name: &str) -> AgentResult<Operation> {
        self.get_json(&["operations", name]).await
    }

    async fn delete_operation(&self, name: &str) -> AgentResult<()> {
        self.send_empty(Method::DELETE, &["operations", name]).await
    }

    async fn list_notifications(&self) -> AgentResult<Vec<Notification>> {
        self.get_json(&["notifications"]).await
    }

    async fn mark_notification(&self, id: &str) -> AgentResult<()> {
        self.send_empty(Method::PUT, &["notifications", id]).await
    }

    async fn delete_notification(&self, id: &str) -> AgentResult<()> {
        self.send_empty(Method::DELETE, &["notifications", id]).await
    }

    async fn send_exchange(
        &self,
        sender_name: &str,
        group_name: &str,
        message: &ExchangeMessage,
    ) -> AgentResult<()> {
        let body = json!({"sender": sender_name, "message": message});
        let _: Value = self
            .send_json(
                Method::POST,
                &["identifiers", group_name, "multisig", "request"],
                &body,
            )
            .await?;
        Ok(())
    }

    async fn get_exchange(&self, said: &str) -> AgentResult<ExchangeRecord> {
        self.get_json(&["exchanges", said]).await
    }

    async fn list_registries(&self, name: &str) -> AgentResult<Vec<Registry>> {
        self.get_json(&["identifiers", name, "registries"]).await
    }

    async fn create_registry(
        &self,
        name: &str,
        registry_name: &str,
        nonce: &str,
    ) -> AgentResult<RegistryResult> {
        let body = json!({"name": registry_name, "nonce": nonce});
        self.send_json(Method::POST, &["identifiers", name, "registries"], &body)
            .await
    }

    async fn issue_credential(&self, name: &str, data: &CredentialData) -> AgentResult<IssuanceResult> {
        self.send_json(Method::POST, &["identifiers", name, "credentials"], data)
            .await
    }

    async fn issued_credentials(
        &self,
        issuer: &str,
        issuee: &str,
        schema: &str,
    ) -> AgentResult<Vec<Credential>> {
        let body = json!({"filter": {"-i": issuer, "-a-i": issuee, "-s": schema}});
        self.send_json(Method::POST, &["credentials", "query"], &body)
            .await
    }

    async fn get_credential(&self, said: &str) -> AgentResult<Option<Credential>> {
        self.get_optional(&["credentials", said]).await
    }

    async fn grant(&self, args: &GrantArgs) -> AgentResult<IpexMessage> {
        self.send_json(Method::POST, &["ipex", "grant"], args).await
    }

    async fn submit_grant(
        &self,
        name: &str,
        grant: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation> {
        let body = IpexSubmission {
            exn: &grant.exn,
            sigs: &grant.sigs,
            atc: &grant.end,
            rec: recipients,
        };
        self.send_json(Method::POST, &["identifiers", name, "ipex", "grant"], &body)
            .await
    }

    async fn admit(&self, args: &AdmitArgs) -> AgentResult<IpexMessage> {
        self.send_json(Method::POST, &["ipex", "admit"], args).await
    }

    async fn submit_admit(
        &self,
        name: &str,
        admit: &IpexMessage,
        recipients: &[String],
    ) -> AgentResult<Operation> {
        let body = IpexSubmission {
            exn: &admit.exn,
            sigs: &admit.sigs,
            atc: &admit.end,
            rec: recipients,
        };
        self.send_json(Method::POST, &["identifiers", name, "ipex", "admit"], &body)
            .await
    }
}
